use crate::{compile, RpnContext, RpnError};
use splot_value::Value;

fn run(src: &str) -> Option<Value> {
    let ctx = RpnContext::new();
    compile(src).unwrap().eval(&ctx).unwrap()
}

fn run_num(src: &str) -> f64 {
    run(src).unwrap().cast_f64().unwrap()
}

macro_rules! check {
    ($name:ident, $src:literal, $expect:expr) => {
        #[test]
        fn $name() {
            let v = run($src).unwrap();
            let e: Value = $expect.into();
            assert!(v.congruent(&e), "{} evaluated to {v}, expected {e}", $src);
        }
    };
}

check!(add, "2 3 +", 5i64);
check!(fmod, "7 3 %", 1i64);
check!(floored_mod, "-7 3 %", 2i64);
check!(sin_turns, "0.25 SIN", 1.0);
check!(floor, "3.7 FLOOR", 3i64);
check!(clamp, "5 2 3 CLAMP", 3i64);
check!(string_eq, ":hello :world ==", false);
check!(xor, "TRUE FALSE XOR", true);
check!(cos_turns, "0.5 COS", -1.0);
check!(asin_turns, "1 ASIN", 0.25);
check!(pow, "2 10 ^", 1024i64);
check!(log_e, "E LOG", 1.0);
check!(min, "3 7 MIN", 3i64);
check!(max, "3 7 MAX", 7i64);
check!(round_half, "2.5 ROUND", 3i64);
check!(ceil, "3.1 CEIL", 4i64);
check!(neg, "5 NEG", -5i64);
check!(abs, "-5 ABS", 5i64);
check!(range_lerp, "0.5 10 20 RANGE", 15.0);
check!(poly2, "2 1 0 3 POLY2", Value::F64(1. + 0. * 2. + 3. * 4.));
check!(cross_family_eq, "1 1.0 ==", true);
check!(strict_eq_families, "1 1.0 ===", false);
check!(strict_eq_same, "1 1 ===", true);
check!(not, "TRUE !", false);
check!(cmp_lt, "1 2 <", true);
check!(cmp_ge, "2 2 >=", true);
check!(float_mod, "-7.5 2 %", 0.5);

#[test]
fn level_split_program() {
    let v = run("0.2 0 1 CLAMP DUP 1 SWAP - 2 / SWAP 2 / 0 [3]").unwrap();
    let a = v.cast_to::<Vec<f64>>().unwrap();
    assert_eq!(a.len(), 3);
    assert!((a[0] - 0.4).abs() < 1e-12);
    assert!((a[1] - 0.1).abs() < 1e-12);
    assert_eq!(a[2], 0.);
}

#[test]
fn rot_leaves_third_on_top() {
    let ctx = RpnContext::new();
    let st = compile("1 2 3 ROT").unwrap().eval_stack(&ctx).unwrap();
    assert_eq!(st, vec![Value::I64(2), Value::I64(3), Value::I64(1)]);
}

#[test]
fn if_else() {
    assert_eq!(run("TRUE IF 1 ELSE 2 ENDIF"), Some(Value::I64(1)));
    assert_eq!(run("FALSE IF 1 ELSE 2 ENDIF"), Some(Value::I64(2)));
    assert_eq!(run("FALSE IF 1 ENDIF"), None);
}

#[test]
fn case_matches_label() {
    let src = "2 CASE 1 OF :one ENDOF 2 OF :two ENDOF :other ENDCASE";
    assert_eq!(run(src), Some(Value::from("two")));
}

#[test]
fn case_default_sees_selector() {
    let src = "9 CASE 1 OF :one ENDOF 1 + ENDCASE";
    assert_eq!(run(src), Some(Value::I64(10)));
}

#[test]
fn do_loop_sums() {
    // 0 + 0 + 1 + 2 + 3 + 4
    assert_eq!(run("0 5 0 DO i + LOOP"), Some(Value::I64(10)));
}

#[test]
fn do_loop_empty_range() {
    assert_eq!(run("7 0 0 DO i + LOOP"), Some(Value::I64(7)));
}

#[test]
fn do_loop_capped() {
    let ctx = RpnContext::new();
    assert!(matches!(
        compile("0 99999999 0 DO i + LOOP").unwrap().eval(&ctx),
        Err(RpnError::Value(_))
    ));
}

#[test]
fn stop_is_no_emission() {
    assert_eq!(run("STOP"), None);
    assert_eq!(run("1 2 + STOP"), None);
    assert_eq!(run(""), None);
}

#[test]
fn map_ops() {
    let v = run("{} :k 5 PUT :k GET").unwrap();
    assert_eq!(v, Value::I64(5));
    assert_eq!(run("{} :missing GET"), Some(Value::Null));
}

#[test]
fn array_ops() {
    let v = run("[] 1 PUSH 2 PUSH POP").unwrap();
    assert_eq!(v, Value::I64(2));
    let v = run("[] 1 PUSH 2 PUSH POP DROP").unwrap();
    assert_eq!(v.cast_to::<Vec<f64>>().unwrap(), vec![1.]);
}

#[test]
fn constants() {
    assert!((run_num("PI") - std::f64::consts::PI).abs() < 1e-12);
    assert!((run_num("TAU") - std::f64::consts::TAU).abs() < 1e-12);
    assert_eq!(run("NULL"), Some(Value::Null));
    assert_eq!(run("1 NOP"), Some(Value::I64(1)));
}

#[test]
fn unknown_token_fails_at_compile() {
    assert!(matches!(compile("2 3 +++"), Err(RpnError::Syntax(_))));
    assert!(matches!(compile("ELSE"), Err(RpnError::Syntax(_))));
    assert!(matches!(compile("IF 1"), Err(RpnError::Syntax(_))));
}

#[test]
fn unknown_variable_fails_at_eval() {
    let ctx = RpnContext::new();
    let p = compile("nosuch 1 +").unwrap();
    assert!(matches!(p.eval(&ctx), Err(RpnError::UnknownVariable(_))));
}

#[test]
fn type_mismatch_fails_at_eval() {
    let ctx = RpnContext::new();
    let p = compile(":text 1 +").unwrap();
    assert!(matches!(p.eval(&ctx), Err(RpnError::Value(_))));
}

#[test]
fn variables_recorded() {
    let p = compile("v v_l - ABS eps >").unwrap();
    assert!(p.references("v"));
    assert!(p.references("v_l"));
    assert!(p.references("eps"));
    assert!(!p.references("ABS"));
}

#[test]
fn rnd_in_unit_interval() {
    for _ in 0..32 {
        let v = run_num("RND");
        assert!((0. ..1.).contains(&v));
    }
}

mod props {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn integer_literals_round_trip(x: i64) {
            prop_assert_eq!(run(&format!("{x}")), Some(Value::I64(x)));
        }

        #[test]
        fn addition_matches_f64(a in -1e6f64..1e6, b in -1e6f64..1e6) {
            let v = run_num(&format!("{a:?} {b:?} +"));
            prop_assert!((v - (a + b)).abs() < 1e-9);
        }

        #[test]
        fn clamp_stays_in_bounds(v in -10f64..10., lo in -1f64..0., hi in 0f64..1.) {
            let out = run_num(&format!("{v:?} {lo:?} {hi:?} CLAMP"));
            prop_assert!((lo..=hi).contains(&out));
        }

        #[test]
        fn compile_never_panics(src in "[ -~]{0,64}") {
            let _ = crate::compile(&src);
        }
    }
}
