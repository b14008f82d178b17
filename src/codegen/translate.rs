//! IR-to-Cranelift translation for a single function
//!
//! Virtual registers map onto Cranelift frontend variables, blocks map onto
//! Cranelift blocks, and the first registers of a body are defined from the
//! entry block's parameters.

use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::{
    types, Function, InstBuilder, MemFlags, StackSlotData, StackSlotKind, UserFuncName,
};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Variable};
use cranelift_module::{DataId, FuncId, Module};
use cranelift_object::ObjectModule;
use rustc_hash::FxHashMap;

use crate::error::{UdoError, UdoResult};
use crate::ir::{self, BinOp, CmpCode, Instr, SymbolRef, Terminator};

use super::{lower_signature, lower_val_type};

fn var(reg: ir::Reg) -> Variable {
    Variable::from_u32(reg.0)
}

/// Translate and define one IR function in the object module
pub(crate) fn define_function(
    module: &mut ObjectModule,
    func: &ir::Function,
    clif_id: FuncId,
    func_ids: &FxHashMap<ir::FuncId, FuncId>,
    data_ids: &FxHashMap<ir::GlobalId, DataId>,
    external_ids: &FxHashMap<String, FuncId>,
) -> UdoResult<()> {
    let body = func.body.as_ref().expect("only defined functions reach here");
    let pointer_type = module.target_config().pointer_type();
    let call_conv = module.target_config().default_call_conv;

    let mut clif_func = Function::with_name_signature(
        UserFuncName::user(0, clif_id.as_u32()),
        lower_signature(&func.sig, pointer_type, call_conv),
    );

    let mut builder_ctx = FunctionBuilderContext::new();
    let mut builder = FunctionBuilder::new(&mut clif_func, &mut builder_ctx);

    // Declare a variable per virtual register
    for (index, &ty) in body.reg_types.iter().enumerate() {
        builder.declare_var(
            Variable::from_u32(index as u32),
            lower_val_type(ty, pointer_type),
        );
    }

    // Stack slots
    let slots: Vec<_> = body
        .stack_slots
        .iter()
        .map(|slot| {
            let align_shift = slot.align.max(1).ilog2() as u8;
            builder.create_sized_stack_slot(StackSlotData::new(
                StackSlotKind::ExplicitSlot,
                slot.size,
                align_shift,
            ))
        })
        .collect();

    // Blocks
    let blocks: Vec<_> = body.blocks.iter().map(|_| builder.create_block()).collect();

    // Entry: bind the parameter registers
    let entry = blocks[0];
    builder.append_block_params_for_function_params(entry);
    builder.switch_to_block(entry);
    let params: Vec<_> = builder.block_params(entry).to_vec();
    for (index, &value) in params.iter().enumerate() {
        builder.def_var(Variable::from_u32(index as u32), value);
    }

    for (block_index, block) in body.blocks.iter().enumerate() {
        if block_index != 0 {
            builder.switch_to_block(blocks[block_index]);
        }

        for instr in &block.instrs {
            translate_instr(
                module,
                &mut builder,
                instr,
                &slots,
                func_ids,
                data_ids,
                external_ids,
                pointer_type,
                call_conv,
            )?;
        }

        match &block.terminator {
            Terminator::Jump(label) => {
                builder.ins().jump(blocks[label.0 as usize], &[]);
            }
            Terminator::Branch {
                cond,
                then_label,
                else_label,
            } => {
                let cond = builder.use_var(var(*cond));
                builder.ins().brif(
                    cond,
                    blocks[then_label.0 as usize],
                    &[],
                    blocks[else_label.0 as usize],
                    &[],
                );
            }
            Terminator::Return(value) => {
                match value {
                    Some(reg) => {
                        let value = builder.use_var(var(*reg));
                        builder.ins().return_(&[value]);
                    }
                    None => {
                        // Unreachable filler blocks may carry a bare return
                        // in a function with a result; give them a zero so
                        // the verifier stays happy.
                        match func.sig.ret {
                            None => {
                                builder.ins().return_(&[]);
                            }
                            Some(ret_ty) => {
                                let ty = lower_val_type(ret_ty, pointer_type);
                                let zero = if ty.is_float() {
                                    if ty == types::F32 {
                                        builder.ins().f32const(0.0)
                                    } else {
                                        builder.ins().f64const(0.0)
                                    }
                                } else {
                                    builder.ins().iconst(ty, 0)
                                };
                                builder.ins().return_(&[zero]);
                            }
                        }
                    }
                }
            }
        }
    }

    builder.seal_all_blocks();
    builder.finalize();

    let mut ctx = cranelift_codegen::Context::for_function(clif_func);
    module
        .define_function(clif_id, &mut ctx)
        .map_err(|e| UdoError::compile(format!("{} in {}", e, func.name)))?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn translate_instr(
    module: &mut ObjectModule,
    builder: &mut FunctionBuilder,
    instr: &Instr,
    slots: &[cranelift_codegen::ir::StackSlot],
    func_ids: &FxHashMap<ir::FuncId, FuncId>,
    data_ids: &FxHashMap<ir::GlobalId, DataId>,
    external_ids: &FxHashMap<String, FuncId>,
    pointer_type: cranelift_codegen::ir::Type,
    call_conv: cranelift_codegen::isa::CallConv,
) -> UdoResult<()> {
    match instr {
        Instr::Iconst { dst, ty, value } => {
            let value = builder
                .ins()
                .iconst(lower_val_type(*ty, pointer_type), *value);
            builder.def_var(var(*dst), value);
        }
        Instr::Fconst { dst, ty, value } => {
            let value = match ty {
                ir::ValType::F32 => builder.ins().f32const(*value as f32),
                _ => builder.ins().f64const(*value),
            };
            builder.def_var(var(*dst), value);
        }
        Instr::SymbolAddr { dst, symbol } => {
            let value = match symbol {
                SymbolRef::Func(id) => {
                    let func_ref = module.declare_func_in_func(func_ids[id], builder.func);
                    builder.ins().func_addr(pointer_type, func_ref)
                }
                SymbolRef::Global(id) => {
                    let data_ref = module.declare_data_in_func(data_ids[id], builder.func);
                    builder.ins().symbol_value(pointer_type, data_ref)
                }
                SymbolRef::External(name) => {
                    return Err(UdoError::compile(format!(
                        "unresolved external symbol reference {}",
                        name
                    )))
                }
            };
            builder.def_var(var(*dst), value);
        }
        Instr::StackAddr { dst, slot } => {
            let value = builder
                .ins()
                .stack_addr(pointer_type, slots[slot.0 as usize], 0);
            builder.def_var(var(*dst), value);
        }
        Instr::Load {
            dst,
            ty,
            addr,
            offset,
        } => {
            let addr = builder.use_var(var(*addr));
            let value = builder.ins().load(
                lower_val_type(*ty, pointer_type),
                MemFlags::new(),
                addr,
                *offset,
            );
            builder.def_var(var(*dst), value);
        }
        Instr::Store {
            ty: _,
            addr,
            offset,
            value,
        } => {
            let addr = builder.use_var(var(*addr));
            let value = builder.use_var(var(*value));
            builder.ins().store(MemFlags::new(), value, addr, *offset);
        }
        Instr::Binary {
            dst,
            op,
            ty,
            lhs,
            rhs,
        } => {
            let lhs = builder.use_var(var(*lhs));
            let rhs = builder.use_var(var(*rhs));
            let is_float = ty.is_float();
            let value = match op {
                BinOp::Add if is_float => builder.ins().fadd(lhs, rhs),
                BinOp::Sub if is_float => builder.ins().fsub(lhs, rhs),
                BinOp::Mul if is_float => builder.ins().fmul(lhs, rhs),
                BinOp::Div { .. } if is_float => builder.ins().fdiv(lhs, rhs),
                BinOp::Add => builder.ins().iadd(lhs, rhs),
                BinOp::Sub => builder.ins().isub(lhs, rhs),
                BinOp::Mul => builder.ins().imul(lhs, rhs),
                BinOp::Div { signed: true } => builder.ins().sdiv(lhs, rhs),
                BinOp::Div { signed: false } => builder.ins().udiv(lhs, rhs),
                BinOp::Rem { signed: true } => builder.ins().srem(lhs, rhs),
                BinOp::Rem { signed: false } => builder.ins().urem(lhs, rhs),
                BinOp::And => builder.ins().band(lhs, rhs),
                BinOp::Or => builder.ins().bor(lhs, rhs),
                BinOp::Xor => builder.ins().bxor(lhs, rhs),
                BinOp::Shl => builder.ins().ishl(lhs, rhs),
                BinOp::Shr { signed: true } => builder.ins().sshr(lhs, rhs),
                BinOp::Shr { signed: false } => builder.ins().ushr(lhs, rhs),
            };
            builder.def_var(var(*dst), value);
        }
        Instr::IntCmp {
            dst,
            cc,
            signed,
            ty: _,
            lhs,
            rhs,
        } => {
            let lhs = builder.use_var(var(*lhs));
            let rhs = builder.use_var(var(*rhs));
            let cc = int_cc(*cc, *signed);
            let value = builder.ins().icmp(cc, lhs, rhs);
            builder.def_var(var(*dst), value);
        }
        Instr::FloatCmp {
            dst,
            cc,
            ty: _,
            lhs,
            rhs,
        } => {
            let lhs = builder.use_var(var(*lhs));
            let rhs = builder.use_var(var(*rhs));
            let cc = match cc {
                CmpCode::Eq => FloatCC::Equal,
                CmpCode::Ne => FloatCC::NotEqual,
                CmpCode::Lt => FloatCC::LessThan,
                CmpCode::Le => FloatCC::LessThanOrEqual,
                CmpCode::Gt => FloatCC::GreaterThan,
                CmpCode::Ge => FloatCC::GreaterThanOrEqual,
            };
            let value = builder.ins().fcmp(cc, lhs, rhs);
            builder.def_var(var(*dst), value);
        }
        Instr::Extend {
            dst,
            to,
            from: _,
            src,
            signed,
        } => {
            let src = builder.use_var(var(*src));
            let ty = lower_val_type(*to, pointer_type);
            let value = if *signed {
                builder.ins().sextend(ty, src)
            } else {
                builder.ins().uextend(ty, src)
            };
            builder.def_var(var(*dst), value);
        }
        Instr::Truncate { dst, to, src } => {
            let src = builder.use_var(var(*src));
            let value = builder.ins().ireduce(lower_val_type(*to, pointer_type), src);
            builder.def_var(var(*dst), value);
        }
        Instr::FloatToInt {
            dst,
            to,
            src,
            signed,
        } => {
            let src = builder.use_var(var(*src));
            let target = lower_val_type(*to, pointer_type);
            // Convert through at least 32 bits, then narrow
            let wide = if target.bytes() < 4 { types::I32 } else { target };
            let value = if *signed {
                builder.ins().fcvt_to_sint_sat(wide, src)
            } else {
                builder.ins().fcvt_to_uint_sat(wide, src)
            };
            let value = if wide != target {
                builder.ins().ireduce(target, value)
            } else {
                value
            };
            builder.def_var(var(*dst), value);
        }
        Instr::IntToFloat {
            dst,
            to,
            from,
            src,
            signed,
        } => {
            let mut src = builder.use_var(var(*src));
            // Widen sub-32-bit sources first
            if from.bytes() < 4 {
                src = if *signed {
                    builder.ins().sextend(types::I32, src)
                } else {
                    builder.ins().uextend(types::I32, src)
                };
            }
            let ty = lower_val_type(*to, pointer_type);
            let value = if *signed {
                builder.ins().fcvt_from_sint(ty, src)
            } else {
                builder.ins().fcvt_from_uint(ty, src)
            };
            builder.def_var(var(*dst), value);
        }
        Instr::FloatConvert { dst, to, src } => {
            let src = builder.use_var(var(*src));
            let value = match to {
                ir::ValType::F64 => builder.ins().fpromote(types::F64, src),
                _ => builder.ins().fdemote(types::F32, src),
            };
            builder.def_var(var(*dst), value);
        }
        Instr::Call { dst, callee, args } => {
            let clif_id = match callee {
                ir::Callee::Func(id) => func_ids[id],
                ir::Callee::External { name, .. } => external_ids[name],
            };
            let func_ref = module.declare_func_in_func(clif_id, builder.func);
            let args: Vec<_> = args.iter().map(|reg| builder.use_var(var(*reg))).collect();
            let call = builder.ins().call(func_ref, &args);
            if let Some(dst) = dst {
                let results = builder.inst_results(call);
                debug_assert!(!results.is_empty());
                let value = results[0];
                builder.def_var(var(*dst), value);
            }
        }
        Instr::CallIndirect {
            dst,
            sig,
            callee,
            args,
        } => {
            let clif_sig = lower_signature(sig, pointer_type, call_conv);
            let sig_ref = builder.import_signature(clif_sig);
            let callee = builder.use_var(var(*callee));
            let args: Vec<_> = args.iter().map(|reg| builder.use_var(var(*reg))).collect();
            let call = builder.ins().call_indirect(sig_ref, callee, &args);
            if let Some(dst) = dst {
                let results = builder.inst_results(call);
                debug_assert!(!results.is_empty());
                let value = results[0];
                builder.def_var(var(*dst), value);
            }
        }
    }
    Ok(())
}

fn int_cc(cc: CmpCode, signed: bool) -> IntCC {
    match (cc, signed) {
        (CmpCode::Eq, _) => IntCC::Equal,
        (CmpCode::Ne, _) => IntCC::NotEqual,
        (CmpCode::Lt, true) => IntCC::SignedLessThan,
        (CmpCode::Lt, false) => IntCC::UnsignedLessThan,
        (CmpCode::Le, true) => IntCC::SignedLessThanOrEqual,
        (CmpCode::Le, false) => IntCC::UnsignedLessThanOrEqual,
        (CmpCode::Gt, true) => IntCC::SignedGreaterThan,
        (CmpCode::Gt, false) => IntCC::UnsignedGreaterThan,
        (CmpCode::Ge, true) => IntCC::SignedGreaterThanOrEqual,
        (CmpCode::Ge, false) => IntCC::UnsignedGreaterThanOrEqual,
    }
}
