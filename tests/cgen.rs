//! End-to-end tests: generate, execute, and check both the returned value
//! and the memory side effects.

#![cfg(all(target_arch = "x86_64", unix))]

use featherjit::{Error, Function, Jit};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn add_and_return() {
    init_logging();
    let mut val: i32 = 40;

    let mut f = Function::new("simple", 4096).unwrap();
    let a = f.gen_local_i32("a", 2).unwrap();
    let b = f.gen_global_i32("b", &mut val).unwrap();
    let c = f.gen_local_i32("c", -2).unwrap();
    f.gen_add(&a, &b).unwrap();
    f.gen_sub(&b, &c).unwrap();
    f.gen_ret_val(&a).unwrap();

    let ret = f.exec().unwrap();
    assert_eq!(ret as i32, 42);
    assert_eq!(val, 42);
}

#[test]
fn conditional_branch_max() {
    init_logging();
    let mut a: i32 = 40;
    let mut b: i32 = 42;

    let mut f = Function::new("max", 4096).unwrap();
    let mut less = f.gen_label("less");
    let va = f.gen_global_i32("a", &mut a).unwrap();
    let vb = f.gen_global_i32("b", &mut b).unwrap();
    f.gen_cmp(&va, &vb).unwrap();
    f.gen_jl(&mut less, false).unwrap();
    f.gen_ret_val(&va).unwrap();
    f.place(&mut less).unwrap();
    f.gen_ret_val(&vb).unwrap();

    assert_eq!(f.exec().unwrap() as i32, 42);
}

#[test]
fn functions_share_a_buffer() {
    init_logging();
    let mut jit = Jit::new(8192).unwrap();

    let add = {
        let mut f = jit.gen_function("add");
        let x = f.gen_local_i32("x", 22).unwrap();
        let y = f.gen_local_i32("y", 20).unwrap();
        f.gen_add(&x, &y).unwrap();
        f.gen_ret_val(&x).unwrap();
        f.exec().unwrap()
    };

    let sub = {
        let mut f = jit.gen_function("sub");
        let x = f.gen_local_i32("x", 17).unwrap();
        let y = f.gen_local_i32("y", 11).unwrap();
        f.gen_sub(&x, &y).unwrap();
        f.gen_ret_val(&x).unwrap();
        f.exec().unwrap()
    };

    assert_eq!(add as i32, 42);
    assert_eq!(sub as i32, 6);
}

#[test]
fn unsigned_mul_div_mod() {
    init_logging();
    let mut b: i32 = 5;

    let mut f = Function::new("umuldiv", 8192).unwrap();
    let vb = f.gen_global_i32("b", &mut b).unwrap();
    let vx = f.gen_local_i32("x", 16).unwrap();
    let vy = f.gen_local_i32("y", 16).unwrap();
    let vz = f.gen_local_i32("z", 16).unwrap();
    f.gen_umul(&vx, &vb).unwrap();
    f.gen_udiv(&vy, &vb).unwrap();
    f.gen_umod(&vz, &vb).unwrap();
    // combine into one result: 80 * 10000 + 3 * 100 + 1
    f.gen_imuli(&vx, 10000).unwrap();
    f.gen_imuli(&vy, 100).unwrap();
    f.gen_add(&vx, &vy).unwrap();
    f.gen_add(&vx, &vz).unwrap();
    f.gen_ret_val(&vx).unwrap();

    assert_eq!(f.exec().unwrap() as i32, 800_301);
}

#[test]
fn division_by_immediates() {
    init_logging();

    let mut f = Function::new("idivi", 4096).unwrap();
    let x = f.gen_local_i32("x", 16).unwrap();
    f.gen_idivi(&x, -5).unwrap();
    f.gen_ret_val(&x).unwrap();
    assert_eq!(f.exec().unwrap() as i32, -3);

    let mut f = Function::new("imodi", 4096).unwrap();
    let x = f.gen_local_i32("x", 16).unwrap();
    f.gen_imodi(&x, -5).unwrap();
    f.gen_ret_val(&x).unwrap();
    assert_eq!(f.exec().unwrap() as i32, 1);

    let mut f = Function::new("udivi", 4096).unwrap();
    let x = f.gen_local_i32("x", 16).unwrap();
    f.gen_udivi(&x, 5).unwrap();
    f.gen_umuli(&x, 7).unwrap();
    f.gen_umodi(&x, 4).unwrap();
    f.gen_ret_val(&x).unwrap();
    // (16 / 5) * 7 % 4
    assert_eq!(f.exec().unwrap() as i32, 1);
}

#[test]
fn byte_width_division_is_rejected() {
    init_logging();
    let mut f = Function::new("bad", 4096).unwrap();
    let a = f.gen_local_i8("a", 16).unwrap();
    let b = f.gen_local_i8("b", 5).unwrap();
    assert!(matches!(
        f.gen_idiv(&a, &b),
        Err(Error::InvalidOperand(_))
    ));
}

#[test]
fn near_jump_out_of_range() {
    init_logging();
    let mut f = Function::new("far", 16384).unwrap();
    let mut l = f.gen_label("target");
    let a = f.gen_local_i32("a", 0).unwrap();
    f.gen_jmp(&mut l, false).unwrap();
    for _ in 0..64 {
        f.gen_addi(&a, 1).unwrap();
    }
    assert!(matches!(
        f.place(&mut l),
        Err(Error::DisplacementTooLarge)
    ));
}

#[test]
fn backward_jump_makes_a_loop() {
    init_logging();
    let mut f = Function::new("loop", 4096).unwrap();
    let i = f.gen_local_i64("i", 10).unwrap();
    let acc = f.gen_local_i64("acc", 0).unwrap();
    let mut top = f.gen_label("top");
    f.place(&mut top).unwrap();
    f.gen_addi(&acc, 2).unwrap();
    f.gen_subi(&i, 1).unwrap();
    f.gen_jnz(&mut top, false).unwrap();
    f.gen_ret_val(&acc).unwrap();

    assert_eq!(f.exec().unwrap(), 20);
}

#[test]
fn compare_and_select() {
    init_logging();
    let mut f = Function::new("select", 4096).unwrap();
    let a = f.gen_local_i64("a", 40).unwrap();
    let b = f.gen_local_i64("b", 42).unwrap();
    let flag = f.gen_local_i64("flag", 0).unwrap();
    let max = f.gen_local_i64("max", 0).unwrap();

    f.gen_cmp(&a, &b).unwrap();
    f.gen_setl(&flag).unwrap();
    f.gen_mov(&max, &a).unwrap();
    f.gen_cmp(&a, &b).unwrap();
    f.gen_cmovl(&max, &b).unwrap();

    // max * 10 + flag = 421
    f.gen_imuli(&max, 10).unwrap();
    f.gen_add(&max, &flag).unwrap();
    f.gen_ret_val(&max).unwrap();

    assert_eq!(f.exec().unwrap(), 421);
}

#[test]
fn shifts_and_bit_ops() {
    init_logging();
    let mut f = Function::new("bits", 4096).unwrap();
    let a = f.gen_local_i64("a", 1).unwrap();
    f.gen_shli(&a, 5).unwrap();
    f.gen_btsi(&a, 1).unwrap();
    f.gen_ori(&a, 8).unwrap();
    f.gen_ret_val(&a).unwrap();
    assert_eq!(f.exec().unwrap(), 42);

    let mut f = Function::new("varshift", 4096).unwrap();
    let b = f.gen_local_i64("b", 2).unwrap();
    let n = f.gen_local_i64("n", 3).unwrap();
    f.gen_shl(&b, &n).unwrap();
    f.gen_ret_val(&b).unwrap();
    assert_eq!(f.exec().unwrap(), 16);
}

#[test]
fn unary_ops() {
    init_logging();
    let mut f = Function::new("unary", 4096).unwrap();
    let a = f.gen_local_i64("a", -43).unwrap();
    f.gen_not(&a).unwrap(); // 42
    f.gen_inc(&a).unwrap(); // 43
    f.gen_dec(&a).unwrap(); // 42
    f.gen_neg(&a).unwrap(); // -42
    f.gen_neg(&a).unwrap(); // 42
    f.gen_ret_val(&a).unwrap();
    assert_eq!(f.exec().unwrap(), 42);
}

#[test]
fn exchange_and_lea() {
    init_logging();
    let mut f = Function::new("xchg", 4096).unwrap();
    let a = f.gen_local_i64("a", 1).unwrap();
    let b = f.gen_local_i64("b", 2).unwrap();
    let c = f.gen_local_i64("c", 0).unwrap();
    f.gen_xchg(&a, &b).unwrap();
    f.gen_lea(&c, &a, 40).unwrap(); // c = 2 + 40
    f.gen_ret_val(&c).unwrap();
    assert_eq!(f.exec().unwrap(), 42);
}

#[test]
fn width_conversions() {
    init_logging();
    let mut f = Function::new("sxt", 4096).unwrap();
    let small = f.gen_local_i32("small", -1).unwrap();
    let wide = f.gen_local_i64("wide", 0).unwrap();
    f.gen_sxt(&wide, &small).unwrap();
    f.gen_ret_val(&wide).unwrap();
    assert_eq!(f.exec().unwrap(), -1);

    let mut f = Function::new("zxt", 4096).unwrap();
    let small = f.gen_local_i32("small", -1).unwrap();
    let wide = f.gen_local_i64("wide", 0).unwrap();
    f.gen_zxt(&wide, &small).unwrap();
    f.gen_ret_val(&wide).unwrap();
    assert_eq!(f.exec().unwrap(), 0xffff_ffff);
}

#[test]
fn byte_width_values() {
    init_logging();
    let mut f = Function::new("bytes", 4096).unwrap();
    let a = f.gen_local_i8("a", 100).unwrap();
    f.gen_addi(&a, -58).unwrap();
    f.gen_ret_val(&a).unwrap();
    assert_eq!(f.exec().unwrap() as u8, 42);
}

#[test]
fn sync_value_writes_the_home() {
    init_logging();
    let mut g: i64 = 40;
    let mut f = Function::new("sync", 4096).unwrap();
    let vg = f.gen_global_i64("g", &mut g).unwrap();
    f.gen_addi(&vg, 2).unwrap();
    f.sync_value(&vg).unwrap();
    f.sync_value(&vg).unwrap();
    f.gen_ret_imm(0).unwrap();
    f.exec().unwrap();
    assert_eq!(g, 42);
}

#[test]
fn ret_imm_and_state_machine() {
    init_logging();
    let mut f = Function::new("imm", 4096).unwrap();
    f.gen_ret_imm(-7).unwrap();
    assert!(!f.is_finished());
    f.finish().unwrap();
    assert!(f.is_finished());
    // idempotent
    f.finish().unwrap();
    assert_eq!(f.exec().unwrap(), -7);

    let a = f.gen_label("late");
    let _ = a;
    let b = f.gen_scratch_i64("s");
    assert!(matches!(b, Err(Error::FunctionSealed)));
}

#[test]
fn unplaced_label_fails_finish() {
    init_logging();
    let mut f = Function::new("unplaced", 4096).unwrap();
    let mut l = f.gen_label("never");
    f.gen_jmp(&mut l, true).unwrap();
    assert!(matches!(f.finish(), Err(Error::UnplacedLabel(1))));
}

#[test]
fn free_value_releases_state() {
    init_logging();
    let mut f = Function::new("free", 4096).unwrap();
    let a = f.gen_local_i64("a", 1).unwrap();
    let b = f.gen_local_i64("b", 2).unwrap();
    f.free_value(a).unwrap();
    f.gen_addi(&b, 40).unwrap();
    f.gen_ret_val(&b).unwrap();
    assert_eq!(f.exec().unwrap(), 42);
}
