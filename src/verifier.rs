//! Post-rewrite sanity pass.
//!
//! Re-decodes every non-decoder method body as it will appear in the output
//! (patched bytes where the rewriter planned a substitution, original bytes
//! elsewhere) and counts `call`/`callvirt` instructions still targeting the
//! decoder type. Residual calls mean the analyzer could not recover every
//! accessor; that is reported as a warning, never an error.

use dotscope::{
    assembly::{decode_stream, Operand},
    Parser,
};

use crate::{
    locator::DecoderBinding,
    module::{Module, PatchSet},
    rewriter::resolve_decoder_target,
    Result,
};

/// Counts residual decoder calls in the rewritten module.
pub fn count_residual_calls(
    module: &Module,
    binding: &DecoderBinding,
    patches: &PatchSet,
) -> Result<usize> {
    let mut residual = 0;

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

        let code = module.method_code_bytes(rva)?;
        let code = patches.apply_to_code(method.token, code);

        let mut parser = Parser::new(&code);
        let instructions =
            decode_stream(&mut parser, u64::from(rva) + body.size_header as u64)?;

        for instruction in &instructions {
            if instruction.mnemonic != "call" && instruction.mnemonic != "callvirt" {
                continue;
            }
            let Operand::Token(target) = &instruction.operand else {
                continue;
            };
            if resolve_decoder_target(module, binding, *target).is_some() {
                residual += 1;
            }
        }
    }

    Ok(residual)
}
