//! Property and method addressing.
//!
//! A property is addressed as `<section>/<trait>/<leaf>` where the
//! section code is one of `s` (state), `c` (config), `m` (metadata).
//! Methods are addressed as `f/<trait>?<leaf>`. Keys precompute their
//! rendered name; equality and hashing go through it.
use crate::error::{Error, Result};
use arcstr::ArcStr;
use compact_str::format_compact;
use enumflags2::bitflags;
use std::{fmt, hash::{Hash, Hasher}, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    State,
    Config,
    Metadata,
}

impl SectionKind {
    pub const ALL: [SectionKind; 3] =
        [SectionKind::State, SectionKind::Config, SectionKind::Metadata];

    pub fn code(&self) -> &'static str {
        match self {
            SectionKind::State => "s",
            SectionKind::Config => "c",
            SectionKind::Metadata => "m",
        }
    }

    pub fn from_code(s: &str) -> Option<SectionKind> {
        match s {
            "s" => Some(SectionKind::State),
            "c" => Some(SectionKind::Config),
            "m" => Some(SectionKind::Metadata),
            _ => None,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            SectionKind::State => 0,
            SectionKind::Config => 1,
            SectionKind::Metadata => 2,
        }
    }
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Flags a trait schema attaches to a property.
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropFlag {
    Get,
    Set,
    Req,
    GetReq,
    SetReq,
    OptGet,
    OptSet,
    Change,
    NoSave,
    NoTrans,
    Reset,
    Volatile,
    Obs,
    Const,
    Experimental,
}

#[derive(Debug, Clone)]
pub struct PropertyKey {
    section: SectionKind,
    trait_id: ArcStr,
    leaf: ArcStr,
    name: ArcStr,
}

impl PropertyKey {
    pub fn new(section: SectionKind, trait_id: ArcStr, leaf: ArcStr) -> Self {
        let name =
            ArcStr::from(format_compact!("{}/{}/{}", section.code(), trait_id, leaf).as_str());
        PropertyKey { section, trait_id, leaf, name }
    }

    pub fn section(&self) -> SectionKind {
        self.section
    }

    pub fn trait_id(&self) -> &ArcStr {
        &self.trait_id
    }

    pub fn leaf(&self) -> &ArcStr {
        &self.leaf
    }

    pub fn name(&self) -> &ArcStr {
        &self.name
    }
}

impl PartialEq for PropertyKey {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for PropertyKey {}

impl Hash for PropertyKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state)
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl FromStr for PropertyKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut it = s.split('/');
        match (it.next(), it.next(), it.next(), it.next()) {
            (Some(sec), Some(tr), Some(leaf), None) => {
                let section = SectionKind::from_code(sec)
                    .ok_or_else(|| Error::PropertyNotFound(ArcStr::from(s)))?;
                Ok(PropertyKey::new(section, ArcStr::from(tr), ArcStr::from(leaf)))
            }
            _ => Err(Error::PropertyNotFound(ArcStr::from(s))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MethodKey {
    trait_id: ArcStr,
    leaf: ArcStr,
    name: ArcStr,
}

impl MethodKey {
    pub fn new(trait_id: ArcStr, leaf: ArcStr) -> Self {
        let name = ArcStr::from(format_compact!("f/{}?{}", trait_id, leaf).as_str());
        MethodKey { trait_id, leaf, name }
    }

    pub fn trait_id(&self) -> &ArcStr {
        &self.trait_id
    }

    pub fn leaf(&self) -> &ArcStr {
        &self.leaf
    }

    pub fn name(&self) -> &ArcStr {
        &self.name
    }
}

impl PartialEq for MethodKey {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for MethodKey {}

impl Hash for MethodKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state)
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A mutation intent attached to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    Increment,
    Toggle,
    Insert,
    Remove,
}

/// A tag accompanying a read or write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Modifier {
    /// Write performs a transition over this many seconds.
    Duration(f64),
    Increment,
    Toggle,
    Insert,
    Remove,
    /// Fetch returns the transition target, not the instantaneous
    /// value.
    TransitionTarget,
    /// Fetch enumerates declared keys even when their value is null.
    All,
}

impl Modifier {
    /// Parse the `&` separated query form, e.g. `d=5&tog`.
    pub fn parse_query(q: &str) -> Result<Vec<Modifier>> {
        let mut mods = Vec::new();
        for part in q.split('&') {
            if part.is_empty() {
                continue;
            }
            let m = match part.split_once('=') {
                Some(("d", secs)) => {
                    let secs = secs
                        .parse::<f64>()
                        .map_err(|_| Error::UnknownResource(ArcStr::from(part)))?;
                    Modifier::Duration(secs)
                }
                None => match part {
                    "inc" => Modifier::Increment,
                    "tog" => Modifier::Toggle,
                    "ins" => Modifier::Insert,
                    "rem" => Modifier::Remove,
                    "target" => Modifier::TransitionTarget,
                    "all" => Modifier::All,
                    _ => return Err(Error::UnknownResource(ArcStr::from(part))),
                },
                Some(_) => return Err(Error::UnknownResource(ArcStr::from(part))),
            };
            mods.push(m);
        }
        Ok(mods)
    }

    /// The transition duration requested by the modifier list, if
    /// any.
    pub fn duration(mods: &[Modifier]) -> Option<f64> {
        mods.iter().find_map(|m| match m {
            Modifier::Duration(d) => Some(*d),
            _ => None,
        })
    }

    /// The mutation intent. More than one mutation modifier on the
    /// same operation is rejected.
    pub fn mutation(mods: &[Modifier]) -> Result<Option<Mutation>> {
        let mut found = None;
        for m in mods {
            let mu = match m {
                Modifier::Increment => Mutation::Increment,
                Modifier::Toggle => Mutation::Toggle,
                Modifier::Insert => Mutation::Insert,
                Modifier::Remove => Mutation::Remove,
                _ => continue,
            };
            if found.is_some() {
                return Err(Error::PropertyOperationUnsupported(arcstr::literal!(
                    "conflicting mutation modifiers"
                )));
            }
            found = Some(mu)
        }
        Ok(found)
    }

    /// Whether a fetch should return the transition target.
    pub fn wants_target(mods: &[Modifier]) -> bool {
        mods.iter().any(|m| {
            matches!(m, Modifier::Duration(_) | Modifier::TransitionTarget)
        })
    }

    pub fn wants_all(mods: &[Modifier]) -> bool {
        mods.iter().any(|m| matches!(m, Modifier::All))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn key_names() {
        let k = PropertyKey::new(
            SectionKind::State,
            arcstr::literal!("onof"),
            arcstr::literal!("v"),
        );
        assert_eq!(k.name().as_str(), "s/onof/v");
        assert_eq!("s/onof/v".parse::<PropertyKey>().unwrap(), k);
        let m = MethodKey::new(arcstr::literal!("scen"), arcstr::literal!("save"));
        assert_eq!(m.name().as_str(), "f/scen?save");
    }

    #[test]
    fn query_modifiers() {
        let mods = Modifier::parse_query("d=5&tog").unwrap();
        assert_eq!(Modifier::duration(&mods), Some(5.));
        assert_eq!(Modifier::mutation(&mods).unwrap(), Some(Mutation::Toggle));
        assert!(Modifier::parse_query("bogus").is_err());
        let collide = Modifier::parse_query("inc&tog").unwrap();
        assert!(Modifier::mutation(&collide).is_err());
    }

    #[test]
    fn target_and_all() {
        let mods = Modifier::parse_query("target&all").unwrap();
        assert!(Modifier::wants_target(&mods));
        assert!(Modifier::wants_all(&mods));
        assert!(Modifier::wants_target(&[Modifier::Duration(1.)]));
    }
}
