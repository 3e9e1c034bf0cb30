use crate::codegen::{
    machine::{
        Function,
        FunctionBuilder,
    },
    targets::x86_64::{
        Instr,
        Target,
        CC,
    },
};

/// `(1 + 2) * 3`
pub fn straight_line_function() -> Function<Target> {
    let mut builder = FunctionBuilder::new("straight_line");
    let a = builder.instr(Instr::MOV64ri { immediate: 1 }, &[]);
    let b = builder.instr(Instr::MOV64ri { immediate: 2 }, &[]);
    let c = builder.instr(Instr::ADD64rr, &[a, b]);
    let d = builder.instr(Instr::MOV64ri { immediate: 3 }, &[]);
    let e = builder.instr(Instr::IMUL64rr, &[c, d]);
    builder.ret(Some(e));
    builder.build()
}

/// `f() + p0 + p1`, both parameters are live across the call.
pub fn call_clobber_function() -> Function<Target> {
    let mut builder = FunctionBuilder::new("call_clobber");
    let p0 = builder.param();
    let p1 = builder.param();
    let call = builder.instr(Instr::CALL64 { callee: "f", args: 0 }, &[]);
    let t = builder.instr(Instr::ADD64rr, &[call, p0]);
    let u = builder.instr(Instr::ADD64rr, &[t, p1]);
    builder.ret(Some(u));
    builder.build()
}

/// Sums `n, n - 1, ..., 1`.
///
/// Blocks are entry, header, body and exit in that order. The counter phi is the first instruction
/// of the header, the accumulator phi the second.
pub fn loop_function() -> Function<Target> {
    let mut builder = FunctionBuilder::new("loop");
    let entry = builder.current_block();
    let header = builder.create_block();
    let body = builder.create_block();
    let exit = builder.create_block();

    let n = builder.param();
    let zero = builder.instr(Instr::MOV64ri { immediate: 0 }, &[]);
    builder.jmp(header);

    builder.switch_to_block(header);
    let i = builder.phi();
    let acc = builder.phi();
    let flags = builder.instr(Instr::CMP64ri { immediate: 0 }, &[i]);
    builder.instr(
        Instr::JCC {
            cc: CC::Eq,
            target: exit,
        },
        &[flags],
    );
    builder.jmp(body);

    builder.switch_to_block(body);
    let next_acc = builder.instr(Instr::ADD64rr, &[acc, i]);
    let next_i = builder.instr(Instr::ADD64ri { immediate: -1 }, &[i]);
    builder.jmp(header);

    builder.switch_to_block(exit);
    builder.ret(Some(acc));

    builder.add_phi_input(i, entry, n);
    builder.add_phi_input(i, body, next_i);
    builder.add_phi_input(acc, entry, zero);
    builder.add_phi_input(acc, body, next_acc);
    builder.build()
}

/// Swaps two values on every iteration and returns their difference.
///
/// The swapped phis are the second and third instruction of the header.
pub fn swap_loop_function() -> Function<Target> {
    let mut builder = FunctionBuilder::new("swap_loop");
    let entry = builder.current_block();
    let header = builder.create_block();
    let body = builder.create_block();
    let exit = builder.create_block();

    let n = builder.param();
    let a0 = builder.instr(Instr::MOV64ri { immediate: 1 }, &[]);
    let b0 = builder.instr(Instr::MOV64ri { immediate: 2 }, &[]);
    builder.jmp(header);

    builder.switch_to_block(header);
    let i = builder.phi();
    let a = builder.phi();
    let b = builder.phi();
    let flags = builder.instr(Instr::CMP64ri { immediate: 0 }, &[i]);
    builder.instr(
        Instr::JCC {
            cc: CC::Eq,
            target: exit,
        },
        &[flags],
    );
    builder.jmp(body);

    builder.switch_to_block(body);
    let next_i = builder.instr(Instr::ADD64ri { immediate: -1 }, &[i]);
    builder.jmp(header);

    builder.switch_to_block(exit);
    let diff = builder.instr(Instr::SUB64rr, &[a, b]);
    builder.ret(Some(diff));

    builder.add_phi_input(i, entry, n);
    builder.add_phi_input(i, body, next_i);
    builder.add_phi_input(a, entry, a0);
    builder.add_phi_input(a, body, b);
    builder.add_phi_input(b, entry, b0);
    builder.add_phi_input(b, body, a);
    builder.build()
}
