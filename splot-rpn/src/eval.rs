use crate::{
    op::{Op, Prim},
    Program, Result, RpnError,
};
use arcstr::{literal, ArcStr};
use compact_str::format_compact;
use indexmap::IndexMap;
use rand::RngExt;
use smallvec::SmallVec;
use splot_value::Value;
use std::sync::Arc as SArc;

/// Loops are total: a single DO ... LOOP may not run more than this
/// many iterations.
const MAX_LOOP: i64 = 65536;

/// Variable resolution for evaluation. Contexts implement this by
/// walking their parent chain.
pub trait VarLookup {
    fn lookup(&self, name: &str) -> Option<Value>;
}

impl VarLookup for fxhash::FxHashMap<ArcStr, Value> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

impl VarLookup for IndexMap<ArcStr, Value> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

fn verr(msg: impl AsRef<str>) -> RpnError {
    RpnError::Value(ArcStr::from(msg.as_ref()))
}

/// A stack slot is either a value or the STOP sentinel.
#[derive(Debug, Clone)]
enum Slot {
    Val(Value),
    Stop,
}

#[derive(Debug, Default)]
struct Stack(SmallVec<[Slot; 16]>);

impl Stack {
    fn push(&mut self, v: Value) {
        self.0.push(Slot::Val(v))
    }

    fn push_slot(&mut self, s: Slot) {
        self.0.push(s)
    }

    fn pop_slot(&mut self) -> Result<Slot> {
        self.0.pop().ok_or_else(|| verr("stack underflow"))
    }

    fn pop(&mut self) -> Result<Value> {
        match self.pop_slot()? {
            Slot::Val(v) => Ok(v),
            Slot::Stop => Err(verr("STOP sentinel used as an operand")),
        }
    }

    fn pop_f64(&mut self) -> Result<f64> {
        Ok(self.pop()?.cast_f64()?)
    }

    fn pop_bool(&mut self) -> Result<bool> {
        Ok(self.pop()?.cast_bool()?)
    }
}

fn int2(a: &Value, b: &Value) -> Option<(i64, i64)> {
    match (a, b) {
        (Value::I64(a), Value::I64(b)) => Some((*a, *b)),
        (_, _) => None,
    }
}

fn num2(stack: &mut Stack) -> Result<(Value, Value)> {
    let b = stack.pop()?;
    let a = stack.pop()?;
    if !a.is_number() || !b.is_number() {
        return Err(verr(format_compact!("expected numbers, got {a} {b}")));
    }
    Ok((a, b))
}

fn arith(
    stack: &mut Stack,
    fi: impl Fn(i64, i64) -> Result<i64>,
    ff: impl Fn(f64, f64) -> Result<f64>,
) -> Result<()> {
    let (a, b) = num2(stack)?;
    let r = match int2(&a, &b) {
        Some((a, b)) => Value::I64(fi(a, b)?),
        None => Value::F64(ff(a.cast_f64()?, b.cast_f64()?)?),
    };
    stack.push(r);
    Ok(())
}

fn cmp(stack: &mut Stack, f: impl Fn(f64, f64) -> bool) -> Result<()> {
    let b = stack.pop_f64()?;
    let a = stack.pop_f64()?;
    stack.push(Value::Bool(f(a, b)));
    Ok(())
}

// a fractional cycle, 0.25 turns is a quarter circle
const TURN: f64 = std::f64::consts::TAU;

fn eval_prim(p: Prim, stack: &mut Stack) -> Result<()> {
    match p {
        Prim::Add => arith(
            stack,
            |a, b| a.checked_add(b).ok_or_else(|| verr("integer overflow")),
            |a, b| Ok(a + b),
        ),
        Prim::Sub => arith(
            stack,
            |a, b| a.checked_sub(b).ok_or_else(|| verr("integer overflow")),
            |a, b| Ok(a - b),
        ),
        Prim::Mul => arith(
            stack,
            |a, b| a.checked_mul(b).ok_or_else(|| verr("integer overflow")),
            |a, b| Ok(a * b),
        ),
        Prim::Div => arith(
            stack,
            |a, b| a.checked_div(b).ok_or_else(|| verr("division by zero")),
            |a, b| {
                if b == 0. {
                    Err(verr("division by zero"))
                } else {
                    Ok(a / b)
                }
            },
        ),
        // floored, not truncated: -7 3 % is 2
        Prim::Mod => arith(
            stack,
            |a, b| {
                if b == 0 {
                    Err(verr("division by zero"))
                } else {
                    Ok(a.rem_euclid(b))
                }
            },
            |a, b| {
                if b == 0. {
                    Err(verr("division by zero"))
                } else {
                    Ok(a - b * (a / b).floor())
                }
            },
        ),
        Prim::Pow => {
            let (a, b) = num2(stack)?;
            let r = match int2(&a, &b) {
                Some((a, e)) if (0..=32).contains(&e) => a
                    .checked_pow(e as u32)
                    .map(Value::I64)
                    .unwrap_or_else(|| Value::F64((a as f64).powi(e as i32))),
                _ => Value::F64(a.cast_f64()?.powf(b.cast_f64()?)),
            };
            stack.push(r);
            Ok(())
        }
        Prim::Log => {
            let v = stack.pop_f64()?;
            if v <= 0. {
                return Err(verr("LOG of a non positive number"));
            }
            stack.push(Value::F64(v.ln()));
            Ok(())
        }
        Prim::Neg => match stack.pop()? {
            Value::I64(i) => {
                stack.push(Value::I64(-i));
                Ok(())
            }
            v => {
                stack.push(Value::F64(-v.cast_f64()?));
                Ok(())
            }
        },
        Prim::Abs => match stack.pop()? {
            Value::I64(i) => {
                stack.push(Value::I64(i.abs()));
                Ok(())
            }
            v => {
                stack.push(Value::F64(v.cast_f64()?.abs()));
                Ok(())
            }
        },
        Prim::Min => arith(stack, |a, b| Ok(a.min(b)), |a, b| Ok(a.min(b))),
        Prim::Max => arith(stack, |a, b| Ok(a.max(b)), |a, b| Ok(a.max(b))),
        Prim::Round => {
            let r = round_op(stack.pop()?, f64::round)?;
            stack.push(r);
            Ok(())
        }
        Prim::Floor => {
            let r = round_op(stack.pop()?, f64::floor)?;
            stack.push(r);
            Ok(())
        }
        Prim::Ceil => {
            let r = round_op(stack.pop()?, f64::ceil)?;
            stack.push(r);
            Ok(())
        }
        Prim::Sin => {
            let t = stack.pop_f64()?;
            stack.push(Value::F64((t * TURN).sin()));
            Ok(())
        }
        Prim::Cos => {
            let t = stack.pop_f64()?;
            stack.push(Value::F64((t * TURN).cos()));
            Ok(())
        }
        Prim::Asin => {
            let v = stack.pop_f64()?;
            if !(-1. ..=1.).contains(&v) {
                return Err(verr("ASIN domain"));
            }
            stack.push(Value::F64(v.asin() / TURN));
            Ok(())
        }
        Prim::Acos => {
            let v = stack.pop_f64()?;
            if !(-1. ..=1.).contains(&v) {
                return Err(verr("ACOS domain"));
            }
            stack.push(Value::F64(v.acos() / TURN));
            Ok(())
        }
        // ratio lo hi RANGE maps the ratio into [lo, hi]
        Prim::Range => {
            let hi = stack.pop_f64()?;
            let lo = stack.pop_f64()?;
            let r = stack.pop_f64()?;
            stack.push(Value::F64(lo + r * (hi - lo)));
            Ok(())
        }
        // v lo hi CLAMP
        Prim::Clamp => {
            let hi = stack.pop()?;
            let lo = stack.pop()?;
            let v = stack.pop()?;
            let r = match (int2(&v, &lo), &hi) {
                (Some((v, lo)), Value::I64(hi)) => Value::I64(v.max(lo).min(*hi)),
                (_, _) => {
                    Value::F64(v.cast_f64()?.clamp(lo.cast_f64()?, hi.cast_f64()?))
                }
            };
            stack.push(r);
            Ok(())
        }
        Prim::Poly2 => {
            let c2 = stack.pop_f64()?;
            let c1 = stack.pop_f64()?;
            let c0 = stack.pop_f64()?;
            let x = stack.pop_f64()?;
            stack.push(Value::F64(c0 + c1 * x + c2 * x * x));
            Ok(())
        }
        Prim::Poly3 => {
            let c3 = stack.pop_f64()?;
            let c2 = stack.pop_f64()?;
            let c1 = stack.pop_f64()?;
            let c0 = stack.pop_f64()?;
            let x = stack.pop_f64()?;
            stack.push(Value::F64(c0 + c1 * x + c2 * x * x + c3 * x * x * x));
            Ok(())
        }
        Prim::Rnd => {
            stack.push(Value::F64(rand::rng().random::<f64>()));
            Ok(())
        }
        Prim::Eq => {
            let b = stack.pop()?;
            let a = stack.pop()?;
            stack.push(Value::Bool(a.congruent(&b)));
            Ok(())
        }
        Prim::Ne => {
            let b = stack.pop()?;
            let a = stack.pop()?;
            stack.push(Value::Bool(!a.congruent(&b)));
            Ok(())
        }
        Prim::Identical => {
            let b = stack.pop()?;
            let a = stack.pop()?;
            stack.push(Value::Bool(a.identical(&b)));
            Ok(())
        }
        Prim::Lt => cmp(stack, |a, b| a < b),
        Prim::Le => cmp(stack, |a, b| a <= b),
        Prim::Gt => cmp(stack, |a, b| a > b),
        Prim::Ge => cmp(stack, |a, b| a >= b),
        Prim::And => {
            let b = stack.pop_bool()?;
            let a = stack.pop_bool()?;
            stack.push(Value::Bool(a && b));
            Ok(())
        }
        Prim::Or => {
            let b = stack.pop_bool()?;
            let a = stack.pop_bool()?;
            stack.push(Value::Bool(a || b));
            Ok(())
        }
        Prim::Xor => {
            let b = stack.pop_bool()?;
            let a = stack.pop_bool()?;
            stack.push(Value::Bool(a ^ b));
            Ok(())
        }
        Prim::Not => {
            let a = stack.pop_bool()?;
            stack.push(Value::Bool(!a));
            Ok(())
        }
        Prim::Dup => {
            let s = stack.pop_slot()?;
            stack.push_slot(s.clone());
            stack.push_slot(s);
            Ok(())
        }
        Prim::Swap => {
            let b = stack.pop_slot()?;
            let a = stack.pop_slot()?;
            stack.push_slot(b);
            stack.push_slot(a);
            Ok(())
        }
        Prim::Drop => {
            stack.pop_slot()?;
            Ok(())
        }
        Prim::Over => {
            let b = stack.pop_slot()?;
            let a = stack.pop_slot()?;
            stack.push_slot(a.clone());
            stack.push_slot(b);
            stack.push_slot(a);
            Ok(())
        }
        // a b c ROT leaves b c a, the third item comes to the top
        Prim::Rot => {
            let c = stack.pop_slot()?;
            let b = stack.pop_slot()?;
            let a = stack.pop_slot()?;
            stack.push_slot(b);
            stack.push_slot(c);
            stack.push_slot(a);
            Ok(())
        }
        Prim::NewMap => {
            stack.push(Value::Map(SArc::new(IndexMap::new())));
            Ok(())
        }
        Prim::MapGet => {
            let k = stack.pop()?.cast_str()?;
            let m = stack.pop()?.cast_map()?;
            stack.push(m.get(&k).cloned().unwrap_or(Value::Null));
            Ok(())
        }
        Prim::MapPut => {
            let v = stack.pop()?;
            let k = stack.pop()?.cast_str()?;
            let m = stack.pop()?.cast_map()?;
            let mut m = m.as_ref().clone();
            m.insert(k, v);
            stack.push(Value::Map(SArc::new(m)));
            Ok(())
        }
        Prim::NewArray => {
            stack.push(Value::Array(SArc::from(Vec::<Value>::new())));
            Ok(())
        }
        Prim::Pack(n) => {
            let mut vs = SmallVec::<[Value; 4]>::new();
            for _ in 0..n {
                vs.push(stack.pop()?);
            }
            vs.reverse();
            stack.push(Value::Array(SArc::from(vs.into_vec())));
            Ok(())
        }
        Prim::ArrayPop => {
            let a = stack.pop()?.cast_array()?;
            match a.split_last() {
                None => Err(verr("POP of an empty array")),
                Some((last, rest)) => {
                    stack.push(Value::Array(SArc::from(rest.to_vec())));
                    stack.push(last.clone());
                    Ok(())
                }
            }
        }
        Prim::ArrayPush => {
            let v = stack.pop()?;
            let a = stack.pop()?.cast_array()?;
            let mut a = a.to_vec();
            a.push(v);
            stack.push(Value::Array(SArc::from(a)));
            Ok(())
        }
        Prim::Pi => {
            stack.push(Value::F64(std::f64::consts::PI));
            Ok(())
        }
        Prim::Tau => {
            stack.push(Value::F64(std::f64::consts::TAU));
            Ok(())
        }
        Prim::E => {
            stack.push(Value::F64(std::f64::consts::E));
            Ok(())
        }
        Prim::True => {
            stack.push(Value::Bool(true));
            Ok(())
        }
        Prim::False => {
            stack.push(Value::Bool(false));
            Ok(())
        }
        Prim::Null => {
            stack.push(Value::Null);
            Ok(())
        }
        Prim::Nop => Ok(()),
        Prim::Stop => {
            stack.push_slot(Slot::Stop);
            Ok(())
        }
    }
}

fn round_op(v: Value, f: fn(f64) -> f64) -> Result<Value> {
    match v {
        Value::I64(i) => Ok(Value::I64(i)),
        v => {
            let r = f(v.cast_f64()?);
            if r.is_finite() && r >= i64::MIN as f64 && r <= i64::MAX as f64 {
                Ok(Value::I64(r as i64))
            } else {
                Err(verr("rounding out of range"))
            }
        }
    }
}

struct Frame<'a> {
    vars: &'a dyn VarLookup,
    locals: SmallVec<[(ArcStr, Value); 4]>,
}

impl<'a> Frame<'a> {
    fn load(&self, name: &ArcStr) -> Result<Value> {
        for (n, v) in self.locals.iter().rev() {
            if n == name {
                return Ok(v.clone());
            }
        }
        self.vars
            .lookup(name)
            .ok_or_else(|| RpnError::UnknownVariable(name.clone()))
    }
}

fn exec(ops: &[Op], frame: &mut Frame, stack: &mut Stack) -> Result<()> {
    for op in ops {
        match op {
            Op::Push(v) => stack.push(v.clone()),
            Op::Load(name) => {
                let v = frame.load(name)?;
                stack.push(v);
            }
            Op::Prim(p) => eval_prim(*p, stack)?,
            Op::If { then, otherwise } => {
                if stack.pop_bool()? {
                    exec(then, frame, stack)?
                } else {
                    exec(otherwise, frame, stack)?
                }
            }
            Op::Case { arms, default } => {
                let sel = stack.pop()?;
                let mut matched = false;
                for (label, body) in arms {
                    exec(label, frame, stack)?;
                    let l = stack.pop()?;
                    if l.congruent(&sel) {
                        exec(body, frame, stack)?;
                        matched = true;
                        break;
                    }
                }
                if !matched {
                    // the default body sees the unmatched selector
                    stack.push(sel);
                    exec(default, frame, stack)?;
                }
            }
            Op::Do { body } => {
                let start = stack.pop()?.cast_i64()?;
                let limit = stack.pop()?.cast_i64()?;
                if limit.saturating_sub(start) > MAX_LOOP {
                    return Err(verr("loop bound too large"));
                }
                for i in start..limit {
                    frame.locals.push((literal!("i"), Value::I64(i)));
                    let r = exec(body, frame, stack);
                    frame.locals.pop();
                    r?
                }
            }
        }
    }
    Ok(())
}

impl Program {
    /// Evaluate on an empty stack against `vars`.
    ///
    /// `Ok(None)` means the program produced no emission: either the
    /// stack ended empty or the top of the stack was the STOP
    /// sentinel.
    pub fn eval(&self, vars: &dyn VarLookup) -> Result<Option<Value>> {
        let mut stack = Stack::default();
        let mut frame = Frame { vars, locals: SmallVec::new() };
        exec(&self.ops, &mut frame, &mut stack)?;
        match stack.0.pop() {
            None => Ok(None),
            Some(Slot::Stop) => Ok(None),
            Some(Slot::Val(v)) => Ok(Some(v)),
        }
    }

    /// Evaluate and return the whole final stack, top last. Used by
    /// tests and diagnostics.
    pub fn eval_stack(&self, vars: &dyn VarLookup) -> Result<Vec<Value>> {
        let mut stack = Stack::default();
        let mut frame = Frame { vars, locals: SmallVec::new() };
        exec(&self.ops, &mut frame, &mut stack)?;
        stack
            .0
            .into_iter()
            .map(|s| match s {
                Slot::Val(v) => Ok(v),
                Slot::Stop => Err(verr("STOP sentinel on the final stack")),
            })
            .collect()
    }
}
