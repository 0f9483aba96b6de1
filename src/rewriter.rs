//! Plans in-place `call → ldstr` substitutions across the module.
//!
//! Every method body outside the decoder type is walked in declaration
//! order. A `call` or `callvirt` whose target resolves to a mapped accessor
//! of the decoder type is replaced by an `ldstr` of the recovered literal.
//! Both instruction shapes occupy one opcode byte plus a 4-byte token and
//! both push a single string reference while popping nothing, so the
//! substitution leaves instruction counts, branch targets, and stack
//! balance untouched. Unmapped accessor calls are left alone, so accessors
//! the analyzer skipped stay callable.

use dotscope::{assembly::Operand, metadata::token::Token};
use log::debug;

use crate::{
    accessors::AccessorMap,
    locator::DecoderBinding,
    module::{MethodPatch, Module, PatchSet, Substitution, CALL_WIDTH},
    Result,
};

/// Counters for one rewriting pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct RewriteStats {
    /// Methods with at least one substituted instruction.
    pub methods_patched: usize,
    /// Total substituted instructions.
    pub calls_replaced: usize,
}

/// Result of the rewriting phase.
#[derive(Debug, Default)]
pub struct Rewrite {
    /// The planned substitutions, ready for [`Module::write_patched`].
    pub patches: PatchSet,
    /// Phase counters for the report.
    pub stats: RewriteStats,
}

/// Walks every non-decoder method body and plans a substitution for each
/// call whose target is a mapped accessor.
///
/// The module itself is not mutated; the returned [`PatchSet`] carries the
/// byte-level edits for write time.
pub fn rewrite_call_sites(
    module: &Module,
    binding: &DecoderBinding,
    map: &AccessorMap,
) -> Result<Rewrite> {
    let mut rewrite = Rewrite::default();

    for entry in module.object().methods().iter() {
        let method = entry.value();

        if method.declaring_type_fullname().as_deref() == Some(binding.type_fullname.as_str()) {
            continue;
        }
        let Some(body) = method.body.get() else {
            continue;
        };
        let Some(rva) = method.rva.filter(|rva| *rva > 0) else {
            continue;
        };

        let code_start = u64::from(rva) + body.size_header as u64;
        let mut subs = Vec::new();

        for instruction in method.instructions() {
            if instruction.mnemonic != "call" && instruction.mnemonic != "callvirt" {
                continue;
            }
            let Operand::Token(target) = &instruction.operand else {
                continue;
            };
            let Some(name) = resolve_decoder_target(module, binding, *target) else {
                continue;
            };
            let Some(text) = map.get(&name) else {
                continue;
            };

            debug_assert_eq!(instruction.size as usize, CALL_WIDTH);
            let code_offset = instruction.rva.saturating_sub(code_start) as usize;
            let literal = rewrite.patches.intern(text);
            subs.push(Substitution {
                code_offset,
                literal,
            });
        }

        if !subs.is_empty() {
            debug!(
                "patching {} call site(s) in {}",
                subs.len(),
                method.fullname()
            );
            rewrite.stats.methods_patched += 1;
            rewrite.stats.calls_replaced += subs.len();
            rewrite.patches.push_method(MethodPatch {
                token: method.token,
                rva,
                subs,
            });
        }
    }

    Ok(rewrite)
}

/// Resolves a call target token and returns the target's name when its
/// declaring type is the decoder type.
///
/// Identity is compared by fully qualified name. Within one module accessor
/// calls are MethodDef tokens; MemberRef targets are handled for modules
/// that route the call through a member reference.
pub(crate) fn resolve_decoder_target(
    module: &Module,
    binding: &DecoderBinding,
    target: Token,
) -> Option<String> {
    match target.table() {
        // MethodDef
        0x06 => {
            let entry = module.object().methods().get(&target)?;
            let method = entry.value();
            if method.declaring_type_fullname()? == binding.type_fullname {
                Some(method.name.clone())
            } else {
                None
            }
        }
        // MemberRef
        0x0A => {
            let member = module.object().member_ref(&target)?;
            if member.declaredby.fullname()? == binding.type_fullname {
                Some(member.name.clone())
            } else {
                None
            }
        }
        _ => None,
    }
}
