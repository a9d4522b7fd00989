//! Path URI parsing.
//!
//! The in-process grammar (no scheme for local URIs):
//!
//! ```text
//! /<thing-locator>/<section>/<trait>/<leaf>[?<modifiers>]
//! /<thing-locator>/<section>[?<modifiers>]
//! /<thing-locator>[/<section>]/f/<trait>?<method>
//! /<thing-locator>/f/<trait>/<child-id>/...      (traversal)
//! ```
//!
//! where `<thing-locator>` is a hosted index or `g/<group-id>`.
use crate::{
    error::{Error, Result},
    key::{Modifier, PropertyKey, SectionKind},
};
use arcstr::ArcStr;
use splot_value::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Index(u32),
    Group(ArcStr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Property(PropertyKey),
    Section(SectionKind),
    Method { trait_id: ArcStr, method: ArcStr },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePath {
    pub uri: ArcStr,
    pub locator: Locator,
    /// child traversal steps, each a (trait short id, child id) pair
    pub traverse: Vec<(ArcStr, ArcStr)>,
    pub target: Target,
    pub modifiers: Vec<Modifier>,
}

impl ResourcePath {
    pub fn parse(uri: &str) -> Result<ResourcePath> {
        let bad = || Error::UnknownResource(ArcStr::from(uri));
        let (path, query) = match uri.split_once('?') {
            None => (uri, None),
            Some((p, q)) => (p, Some(q)),
        };
        let path = path.strip_prefix('/').ok_or_else(bad)?;
        let segs: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segs.is_empty() {
            return Err(bad());
        }
        let (locator, mut i) = if segs[0] == "g" {
            let gid = segs.get(1).ok_or_else(bad)?;
            (Locator::Group(ArcStr::from(*gid)), 2)
        } else {
            let idx = segs[0].parse::<u32>().map_err(|_| bad())?;
            (Locator::Index(idx), 1)
        };
        let mut traverse = Vec::new();
        loop {
            // an optional, unused section code may precede a method
            // segment
            let skip = if segs.get(i).map_or(false, |s| SectionKind::from_code(s).is_some())
                && segs.get(i + 1).map_or(false, |s| *s == "f")
            {
                1
            } else {
                0
            };
            if segs.get(i + skip).map_or(true, |s| *s != "f") {
                break;
            }
            let trait_id = segs.get(i + skip + 1).ok_or_else(bad)?;
            match segs.get(i + skip + 2) {
                // `f/<trait>` at the end of the path is a method
                // reference; the query names the method
                None => {
                    let method = query.filter(|q| !q.is_empty()).ok_or_else(bad)?;
                    return Ok(ResourcePath {
                        uri: ArcStr::from(uri),
                        locator,
                        traverse,
                        target: Target::Method {
                            trait_id: ArcStr::from(*trait_id),
                            method: ArcStr::from(method),
                        },
                        modifiers: Vec::new(),
                    });
                }
                Some(child_id) => {
                    traverse.push((ArcStr::from(*trait_id), ArcStr::from(*child_id)));
                    i += skip + 3;
                }
            }
        }
        let target = match &segs[i..] {
            [sec] => Target::Section(
                SectionKind::from_code(sec).ok_or_else(bad)?,
            ),
            [sec, tr, leaf] => {
                let section = SectionKind::from_code(sec).ok_or_else(bad)?;
                Target::Property(PropertyKey::new(
                    section,
                    ArcStr::from(*tr),
                    ArcStr::from(*leaf),
                ))
            }
            _ => return Err(bad()),
        };
        let modifiers = match query {
            None => Vec::new(),
            Some(q) => Modifier::parse_query(q)?,
        };
        Ok(ResourcePath {
            uri: ArcStr::from(uri),
            locator,
            traverse,
            target,
            modifiers,
        })
    }

    /// Parse a method argument body: a map value, null for no
    /// arguments.
    pub fn parse_args(body: &Value) -> Result<crate::dispatch::ArgMap> {
        match body {
            Value::Null => Ok(crate::dispatch::ArgMap::new()),
            Value::Map(m) => Ok(m.as_ref().clone()),
            _ => Err(Error::InvalidMethodArguments(arcstr::literal!("body"))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::key::Mutation;

    #[test]
    fn property_paths() {
        let p = ResourcePath::parse("/1/s/onof/v").unwrap();
        assert_eq!(p.locator, Locator::Index(1));
        assert!(p.traverse.is_empty());
        match &p.target {
            Target::Property(k) => assert_eq!(k.name().as_str(), "s/onof/v"),
            t => panic!("unexpected target {t:?}"),
        }
    }

    #[test]
    fn modifier_paths() {
        let p = ResourcePath::parse("/1/s/levl/v?d=5").unwrap();
        assert_eq!(Modifier::duration(&p.modifiers), Some(5.));
        let p = ResourcePath::parse("/g/kitchen/s/onof/v?tog").unwrap();
        assert_eq!(p.locator, Locator::Group(arcstr::literal!("kitchen")));
        assert_eq!(Modifier::mutation(&p.modifiers).unwrap(), Some(Mutation::Toggle));
    }

    #[test]
    fn traversal_paths() {
        let p = ResourcePath::parse("/1/f/scen/warm/s/lght/mire").unwrap();
        assert_eq!(p.traverse.len(), 1);
        assert_eq!(p.traverse[0].0.as_str(), "scen");
        assert_eq!(p.traverse[0].1.as_str(), "warm");
        match &p.target {
            Target::Property(k) => assert_eq!(k.name().as_str(), "s/lght/mire"),
            t => panic!("unexpected target {t:?}"),
        }
    }

    #[test]
    fn method_paths() {
        let p = ResourcePath::parse("/1/f/scen?save").unwrap();
        match &p.target {
            Target::Method { trait_id, method } => {
                assert_eq!(trait_id.as_str(), "scen");
                assert_eq!(method.as_str(), "save");
            }
            t => panic!("unexpected target {t:?}"),
        }
        // an unused section segment before the method form
        let p = ResourcePath::parse("/2/s/f/timr?create").unwrap();
        assert!(matches!(p.target, Target::Method { .. }));
    }

    #[test]
    fn section_paths() {
        let p = ResourcePath::parse("/3/s?all").unwrap();
        assert_eq!(p.target, Target::Section(SectionKind::State));
        assert!(Modifier::wants_all(&p.modifiers));
    }

    #[test]
    fn rejects_garbage() {
        assert!(ResourcePath::parse("").is_err());
        assert!(ResourcePath::parse("nope").is_err());
        assert!(ResourcePath::parse("/x/s/onof/v").is_err());
        assert!(ResourcePath::parse("/1/q/onof/v").is_err());
        assert!(ResourcePath::parse("/1/s/onof").is_err());
        assert!(ResourcePath::parse("/1/f/scen").is_err());
        assert!(ResourcePath::parse("/1/s/onof/v?bogus").is_err());
    }
}
