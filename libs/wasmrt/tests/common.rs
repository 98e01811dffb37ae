// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![allow(unused, reason = "not used by all tests")]

//! A tiny compiler and executor covering the handful of instructions the
//! tests use: constants, `local.get`, `global.get`, integer add/sub/lt_u,
//! `if`/`else`, `call`, `call_indirect`, `return`, `drop` and `unreachable`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use wasmrt::{
    BinaryReader, CodeRef, CompileContext, Compiler, Config, Environment, Error, ExecContext,
    Executor, FuncIndex, GlobalIndex, Line, NativeExecutor, Opcode, Result, Trap, ValType,
    YieldHook,
};

const ENTER: Opcode = Opcode(0x01);
const CONST: Opcode = Opcode(0x02);
const LOCAL_GET: Opcode = Opcode(0x03);
const GLOBAL_GET: Opcode = Opcode(0x04);
const I32_ADD: Opcode = Opcode(0x10);
const I32_SUB: Opcode = Opcode(0x11);
const I32_LT_U: Opcode = Opcode(0x12);
const I64_ADD: Opcode = Opcode(0x20);
const I64_SUB: Opcode = Opcode(0x21);
const I64_LT_U: Opcode = Opcode(0x22);
const BR: Opcode = Opcode(0x30);
const BR_UNLESS: Opcode = Opcode(0x31);
const CALL: Opcode = Opcode(0x32);
const RETURN: Opcode = Opcode(0x33);
const DROP: Opcode = Opcode(0x34);
const UNREACHABLE: Opcode = Opcode(0x35);
const CALL_INDIRECT: Opcode = Opcode(0x36);

/// `fib(n) = n < 2 ? n : fib(n - 2) + fib(n - 1)` over i64.
pub const FIB_BODY: &[u8] = &[
    0x20, 0x00, // local.get 0
    0x42, 0x02, // i64.const 2
    0x54, // i64.lt_u
    0x04, 0x7e, // if (result i64)
    0x20, 0x00, // local.get 0
    0x05, // else
    0x20, 0x00, // local.get 0
    0x42, 0x02, // i64.const 2
    0x7d, // i64.sub
    0x10, 0x00, // call 0
    0x20, 0x00, // local.get 0
    0x42, 0x01, // i64.const 1
    0x7d, // i64.sub
    0x10, 0x00, // call 0
    0x7c, // i64.add
    0x0b, // end
    0x0b, // end
];

/// The binary encoding of a module exporting [`FIB_BODY`] as `fib`.
pub fn fib_wasm() -> Vec<u8> {
    let mut bytes = b"\0asm\x01\0\0\0".to_vec();
    // type 0: (i64) -> i64
    bytes.extend_from_slice(&[0x01, 0x06, 0x01, 0x60, 0x01, 0x7e, 0x01, 0x7e]);
    // function 0: type 0
    bytes.extend_from_slice(&[0x03, 0x02, 0x01, 0x00]);
    // export "fib"
    bytes.extend_from_slice(&[0x07, 0x07, 0x01, 0x03, b'f', b'i', b'b', 0x00, 0x00]);
    // code: one body of no locals
    let body_len = u8::try_from(FIB_BODY.len() + 1).unwrap();
    bytes.extend_from_slice(&[0x0a, body_len + 2, 0x01, body_len, 0x00]);
    bytes.extend_from_slice(FIB_BODY);
    bytes
}

pub fn env() -> Environment {
    env_with(Config::default())
}

pub fn env_with(config: Config) -> Environment {
    Environment::builder()
        .config(config)
        .compiler(TestCompiler)
        .executor(TestExecutor)
        .build()
}

/// Counts how often executed code yielded.
#[derive(Debug, Default, Clone)]
pub struct CountingYield(pub Arc<AtomicUsize>);

impl CountingYield {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

impl YieldHook for CountingYield {
    fn on_yield(&self) -> Result<()> {
        self.0.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Debug)]
pub struct TestCompiler;

enum Block {
    If(CodeRef),
    Else(CodeRef),
}

fn emit_imm(cx: &mut CompileContext<'_>, op: Opcode, imm: u64) -> Result<CodeRef> {
    cx.emit(Line::Op(op))?;
    cx.emit(Line::Imm(imm))
}

fn patch_to_pc(cx: &mut CompileContext<'_>, at: CodeRef) -> Result<()> {
    let target = cx.pc().line;
    cx.patch(at, Line::Imm(u64::from(target)))
}

/// Compiles a constant producing instruction. Returns `false` for anything
/// else without consuming more bytes.
fn compile_const(
    cx: &mut CompileContext<'_>,
    op: u8,
    reader: &mut BinaryReader<'_>,
) -> Result<bool> {
    match op {
        0x41 => {
            let v = reader.read_var_i32()?;
            emit_imm(cx, CONST, u64::from(v.cast_unsigned()))?;
        }
        0x42 => {
            let v = reader.read_var_i64()?;
            emit_imm(cx, CONST, v.cast_unsigned())?;
        }
        0x23 => {
            let index = reader.read_var_u32()?;
            emit_imm(cx, GLOBAL_GET, u64::from(index))?;
        }
        _ => return Ok(false),
    }
    Ok(true)
}

impl Compiler for TestCompiler {
    fn compile_function(&self, cx: &mut CompileContext<'_>, func: FuncIndex) -> Result<()> {
        let function = cx
            .module()
            .function(func)
            .ok_or(Error::FunctionIndexOutOfRange)?;
        let body = function.body().ok_or(Error::MissingCompiledCode)?;
        let num_params = u64::try_from(function.ty().num_params()).unwrap();

        cx.emit(Line::Op(ENTER))?;
        cx.emit(Line::Imm(num_params))?;
        cx.emit(Line::Imm(u64::from(function.num_locals())))?;

        let mut reader = BinaryReader::new(body);
        let mut blocks = Vec::new();

        loop {
            let op = reader.read_u8()?;
            if compile_const(cx, op, &mut reader)? {
                continue;
            }

            match op {
                0x00 => {
                    cx.emit(Line::Op(UNREACHABLE))?;
                }
                0x04 => {
                    let _block_type = reader.read_u8()?;
                    cx.emit(Line::Op(BR_UNLESS))?;
                    blocks.push(Block::If(cx.emit(Line::Imm(0))?));
                }
                0x05 => {
                    let Some(Block::If(at)) = blocks.pop() else {
                        return Err(Error::UnknownOpcode(u16::from(op)));
                    };
                    cx.emit(Line::Op(BR))?;
                    let skip = cx.emit(Line::Imm(0))?;
                    patch_to_pc(cx, at)?;
                    blocks.push(Block::Else(skip));
                }
                0x0b => match blocks.pop() {
                    Some(Block::If(at) | Block::Else(at)) => patch_to_pc(cx, at)?,
                    None => {
                        cx.emit(Line::Op(RETURN))?;
                        return Ok(());
                    }
                },
                0x0f => {
                    cx.emit(Line::Op(RETURN))?;
                }
                0x10 => {
                    let callee = reader.read_var_u32()?;
                    emit_imm(cx, CALL, u64::from(callee))?;
                }
                0x11 => {
                    let ty = reader.read_var_u32()?;
                    let _table = reader.read_u8()?;
                    emit_imm(cx, CALL_INDIRECT, u64::from(ty))?;
                }
                0x1a => {
                    cx.emit(Line::Op(DROP))?;
                }
                0x20 => {
                    let index = reader.read_var_u32()?;
                    emit_imm(cx, LOCAL_GET, u64::from(index))?;
                }
                0x49 => {
                    cx.emit(Line::Op(I32_LT_U))?;
                }
                0x54 => {
                    cx.emit(Line::Op(I64_LT_U))?;
                }
                0x6a => {
                    cx.emit(Line::Op(I32_ADD))?;
                }
                0x6b => {
                    cx.emit(Line::Op(I32_SUB))?;
                }
                0x7c => {
                    cx.emit(Line::Op(I64_ADD))?;
                }
                0x7d => {
                    cx.emit(Line::Op(I64_SUB))?;
                }
                op => return Err(Error::UnknownOpcode(u16::from(op))),
            }
        }
    }

    fn compile_const_expr(
        &self,
        cx: &mut CompileContext<'_>,
        expr: &[u8],
        _ty: ValType,
    ) -> Result<usize> {
        let mut reader = BinaryReader::new(expr);
        loop {
            let op = reader.read_u8()?;
            if op == 0x0b {
                break;
            }
            if !compile_const(cx, op, &mut reader)? {
                return Err(Error::InvalidConstExpr(op));
            }
        }
        cx.emit(Line::Op(RETURN))?;
        Ok(reader.position())
    }
}

/// Runs [`TestCompiler`] output, delegating call-native sequences to
/// [`NativeExecutor`].
#[derive(Debug)]
pub struct TestExecutor;

impl Executor for TestExecutor {
    fn execute(&self, cx: &mut ExecContext<'_>, entry: CodeRef) -> Result<()> {
        run(cx, entry, 0)
    }
}

fn imm(cx: &ExecContext<'_>, at: CodeRef) -> Result<u64> {
    match cx.fetch(at)? {
        Line::Imm(imm) => Ok(imm),
        _ => Err(Error::InvalidCodeRef),
    }
}

fn imm_u32(cx: &ExecContext<'_>, at: CodeRef) -> Result<u32> {
    u32::try_from(imm(cx, at)?).map_err(|_| Error::InvalidCodeRef)
}

fn imm_usize(cx: &ExecContext<'_>, at: CodeRef) -> Result<usize> {
    usize::try_from(imm(cx, at)?).map_err(|_| Error::InvalidCodeRef)
}

fn read_slot(cx: &mut ExecContext<'_>, index: usize) -> Result<u64> {
    cx.stack()
        .get(index)
        .copied()
        .ok_or(Error::Trap(Trap::StackOverflow))
}

fn write_slot(cx: &mut ExecContext<'_>, index: usize, value: u64) -> Result<()> {
    *cx.stack()
        .get_mut(index)
        .ok_or(Error::Trap(Trap::StackOverflow))? = value;
    Ok(())
}

fn run(cx: &mut ExecContext<'_>, entry: CodeRef, sp: usize) -> Result<()> {
    let mut pc = entry;
    let mut frame = 0;
    let mut operands: Vec<u64> = Vec::new();

    macro_rules! pop {
        () => {
            operands
                .pop()
                .ok_or(Error::Trap(Trap::UnreachableCodeReached))?
        };
    }

    loop {
        let Line::Op(op) = cx.fetch(pc)? else {
            return Err(Error::InvalidCodeRef);
        };

        match op {
            Opcode::CALL_RAW | Opcode::CALL_RAW_EX => {
                return NativeExecutor::call_native_at(cx, pc, sp);
            }
            ENTER => {
                let num_params = imm_usize(cx, pc.offset(1))?;
                let num_locals = imm_usize(cx, pc.offset(2))?;
                frame = num_params + num_locals;
                cx.stack()
                    .get_mut(sp + num_params..sp + frame)
                    .ok_or(Error::Trap(Trap::StackOverflow))?
                    .fill(0);
                pc = pc.offset(3);
                continue;
            }
            CONST => operands.push(imm(cx, pc.offset(1))?),
            LOCAL_GET => {
                let index = sp + imm_usize(cx, pc.offset(1))?;
                operands.push(read_slot(cx, index)?);
            }
            GLOBAL_GET => {
                let index = GlobalIndex::from_u32(imm_u32(cx, pc.offset(1))?);
                let global = cx
                    .module()
                    .and_then(|module| module.global(index))
                    .ok_or(Error::InvalidCodeRef)?;
                operands.push(global.value().to_slot());
            }
            I32_ADD | I32_SUB | I32_LT_U => {
                let b = pop!() & 0xffff_ffff;
                let a = pop!() & 0xffff_ffff;
                let res = match op {
                    I32_ADD => a.wrapping_add(b),
                    I32_SUB => a.wrapping_sub(b),
                    _ => u64::from(a < b),
                };
                operands.push(res & 0xffff_ffff);
            }
            I64_ADD | I64_SUB | I64_LT_U => {
                let b = pop!();
                let a = pop!();
                operands.push(match op {
                    I64_ADD => a.wrapping_add(b),
                    I64_SUB => a.wrapping_sub(b),
                    _ => u64::from(a < b),
                });
            }
            BR => {
                pc.line = imm_u32(cx, pc.offset(1))?;
                continue;
            }
            BR_UNLESS => {
                if pop!() == 0 {
                    pc.line = imm_u32(cx, pc.offset(1))?;
                    continue;
                }
            }
            CALL => {
                let index = FuncIndex::from_u32(imm_u32(cx, pc.offset(1))?);
                call(cx, index, &mut operands, sp + frame)?;
            }
            CALL_INDIRECT => {
                let expected = imm_usize(cx, pc.offset(1))?;
                let slot = usize::try_from(pop!()).map_err(|_| Trap::TableOutOfBounds)?;
                let module = cx.module().ok_or(Error::FunctionLookupFailed)?;
                let index = module
                    .table()
                    .get(slot)
                    .copied()
                    .ok_or(Trap::TableOutOfBounds)?
                    .ok_or(Trap::IndirectCallToNull)?;
                let callee_ty = module
                    .function(index)
                    .ok_or(Error::FunctionIndexOutOfRange)?
                    .ty();
                if module.func_types().nth(expected) != Some(callee_ty) {
                    return Err(Error::Trap(Trap::BadSignature));
                }
                call(cx, index, &mut operands, sp + frame)?;
            }
            RETURN => {
                if let Some(value) = operands.pop() {
                    write_slot(cx, sp, value)?;
                }
                return Ok(());
            }
            DROP => {
                pop!();
            }
            UNREACHABLE => return Err(Error::Trap(Trap::UnreachableCodeReached)),
            op => return Err(Error::UnknownOpcode(op.0)),
        }

        pc = match op {
            CONST | LOCAL_GET | GLOBAL_GET | CALL | CALL_INDIRECT | BR_UNLESS => pc.offset(2),
            _ => pc.offset(1),
        };
    }
}

/// Moves the callee's arguments off the operand stack into its frame at
/// `callee_sp`, runs it and pushes its result.
fn call(
    cx: &mut ExecContext<'_>,
    index: FuncIndex,
    operands: &mut Vec<u64>,
    callee_sp: usize,
) -> Result<()> {
    let target = cx.ensure_compiled(index)?;
    let ty = cx
        .module()
        .and_then(|module| module.function(index))
        .ok_or(Error::FunctionIndexOutOfRange)?
        .ty()
        .clone();

    for i in (0..ty.num_params()).rev() {
        let value = operands
            .pop()
            .ok_or(Error::Trap(Trap::UnreachableCodeReached))?;
        write_slot(cx, callee_sp + i, value)?;
    }

    cx.yield_now()?;
    run(cx, target, callee_sp)?;

    if ty.result().is_some() {
        operands.push(read_slot(cx, callee_sp)?);
    }
    Ok(())
}
