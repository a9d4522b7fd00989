use crate::{
    op::{Op, Prim},
    Program, Result, RpnError,
};
use arcstr::ArcStr;
use compact_str::format_compact;
use fxhash::FxHashSet;
use regex::Regex;
use splot_value::Value;
use std::sync::LazyLock;
use triomphe::Arc;

static VNAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[A-Za-z_][A-Za-z0-9_.]*$").unwrap());

const BRANCH_KEYWORDS: [&str; 9] =
    ["IF", "ELSE", "ENDIF", "CASE", "OF", "ENDOF", "ENDCASE", "DO", "LOOP"];

fn syntax(msg: impl AsRef<str>) -> RpnError {
    RpnError::Syntax(ArcStr::from(msg.as_ref()))
}

struct Compiler<'a> {
    toks: Vec<&'a str>,
    pos: usize,
    vars: FxHashSet<ArcStr>,
}

impl<'a> Compiler<'a> {
    fn next(&mut self) -> Option<&'a str> {
        let t = self.toks.get(self.pos).copied();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    /// Compile a sequence until one of `until` is consumed, returning
    /// the sequence and the terminator. An empty `until` means
    /// end-of-input terminates the sequence.
    fn seq(&mut self, until: &[&str]) -> Result<(Vec<Op>, Option<&'a str>)> {
        let mut ops = Vec::new();
        loop {
            let tok = match self.next() {
                Some(t) => t,
                None if until.is_empty() => return Ok((ops, None)),
                None => {
                    return Err(syntax(format_compact!(
                        "unterminated branch, expected one of {until:?}"
                    )))
                }
            };
            if until.contains(&tok) {
                return Ok((ops, Some(tok)));
            }
            ops.push(self.one(tok)?);
        }
    }

    fn one(&mut self, tok: &'a str) -> Result<Op> {
        match tok {
            "IF" => {
                let (then, term) = self.seq(&["ELSE", "ENDIF"])?;
                let otherwise = match term {
                    Some("ELSE") => self.seq(&["ENDIF"])?.0,
                    _ => Vec::new(),
                };
                Ok(Op::If { then, otherwise })
            }
            "CASE" => {
                let mut arms = Vec::new();
                loop {
                    let (body, term) = self.seq(&["OF", "ENDCASE"])?;
                    match term {
                        Some("OF") => {
                            let (arm, _) = self.seq(&["ENDOF"])?;
                            arms.push((body, arm));
                        }
                        // the last sequence before ENDCASE is the default
                        _ => return Ok(Op::Case { arms, default: body }),
                    }
                }
            }
            "DO" => {
                let (body, _) = self.seq(&["LOOP"])?;
                Ok(Op::Do { body })
            }
            t if BRANCH_KEYWORDS.contains(&t) => {
                Err(syntax(format_compact!("{t} outside of its branch form")))
            }
            t => self.flat(t),
        }
    }

    fn flat(&mut self, tok: &str) -> Result<Op> {
        if let Some(p) = Prim::from_token(tok) {
            return Ok(Op::Prim(p));
        }
        if let Some(rest) = tok.strip_prefix(':') {
            return Ok(Op::Push(Value::String(ArcStr::from(rest))));
        }
        if let Ok(i) = tok.parse::<i64>() {
            return Ok(Op::Push(Value::I64(i)));
        }
        if let Ok(f) = tok.parse::<f64>() {
            return Ok(Op::Push(Value::F64(f)));
        }
        if VNAME.is_match(tok) {
            let name = ArcStr::from(tok);
            self.vars.insert(name.clone());
            return Ok(Op::Load(name));
        }
        Err(syntax(format_compact!("unknown token {tok}")))
    }
}

/// Compile `src` into a [`Program`], recording every variable the
/// program references. Unknown tokens fail here rather than at
/// evaluation time.
pub fn compile(src: &str) -> Result<Program> {
    let mut c = Compiler {
        toks: src.split_whitespace().collect(),
        pos: 0,
        vars: FxHashSet::default(),
    };
    let (ops, _) = c.seq(&[])?;
    Ok(Program {
        ops: Arc::new(ops),
        vars: Arc::new(c.vars),
        src: ArcStr::from(src),
    })
}
