//! Locates the string-decoder type inside a loaded module.
//!
//! The decoder is an auto-generated type holding one large encrypted byte
//! blob plus one parameterless accessor method per obfuscated string. The
//! blob's initial bytes are not stored on the payload field itself: the
//! static initializer loads them from an RVA-backed helper field
//! (`ldtoken <data_field>; …; stsfld <payload_field>`), so the locator
//! reaches through the `.cctor` to find the authoritative data blob.

use dotscope::{
    assembly::Operand,
    metadata::{
        method::{Method, MethodRc},
        signatures::{parse_field_signature, TypeSignature},
        tables::{ClassLayoutRaw, FieldRaw, FieldRvaRaw},
        token::Token,
        typesystem::{CilPrimitiveData, CilType},
    },
};
use log::debug;

use crate::{module::Module, Result};

/// Minimum backing-blob size for a static byte array to qualify as the
/// encrypted payload. Real payloads are far larger than any ordinary
/// initialized array.
pub const PAYLOAD_MIN_SIZE: usize = 50_000;

/// `FieldAttributes` static bit.
const FIELD_STATIC: u32 = 0x10;

/// The located decoder type and everything needed to recover its payload.
///
/// Bound at most once per run and immutable afterwards. The rewriter and
/// verifier compare call targets against [`type_fullname`]: decoder
/// identity is established by fully qualified name, so accessors on
/// unrelated types never match even under name collision.
///
/// [`type_fullname`]: DecoderBinding::type_fullname
#[derive(Debug)]
pub struct DecoderBinding {
    /// TypeDef token of the decoder type.
    pub type_token: Token,
    /// Fully qualified decoder type name.
    pub type_fullname: String,
    /// Name of the static byte-array field holding the encrypted payload.
    pub payload_field: String,
    /// RVA of the payload blob in the image.
    pub payload_rva: u32,
    /// Size of the payload blob in bytes.
    pub payload_size: usize,
    /// Newline-delimited lookup table, when the decoder carries one. Its
    /// presence switches the accessor analysis to the table path.
    pub table_text: Option<String>,
}

/// Scans every non-system defined type in enumeration order and binds the
/// first one that looks like a string decoder: at least one static `uint8[]`
/// field backed by a blob larger than [`PAYLOAD_MIN_SIZE`], and a non-empty
/// method list.
///
/// Returns `Ok(None)` when no type qualifies; that is a clean outcome, not
/// an error.
pub fn locate_decoder(module: &Module) -> Result<Option<DecoderBinding>> {
    for entry in module.object().types().iter() {
        let cil_type = entry.value();

        if cil_type.is_typeref() || cil_type.get_external().is_some() {
            continue;
        }
        if is_system_namespace(&cil_type.namespace) {
            continue;
        }
        if cil_type.methods.is_empty() {
            continue;
        }

        if let Some(binding) = bind_decoder(module, cil_type)? {
            debug!(
                "decoder candidate {} bound via field {} ({} payload bytes)",
                binding.type_fullname, binding.payload_field, binding.payload_size
            );
            return Ok(Some(binding));
        }
    }

    Ok(None)
}

fn is_system_namespace(namespace: &str) -> bool {
    namespace == "System" || namespace.starts_with("System.")
}

/// Tries to bind `cil_type` as the decoder.
fn bind_decoder(module: &Module, cil_type: &CilType) -> Result<Option<DecoderBinding>> {
    let Some(cctor) = type_method_by_name(module, cil_type, ".cctor") else {
        return Ok(None);
    };

    for (_, field) in cil_type.fields.iter() {
        if field.flags & FIELD_STATIC == 0 {
            continue;
        }
        if !is_byte_array(&field.signature.base) {
            continue;
        }

        let Some(data_field) = backing_field_token(&cctor, field.token) else {
            continue;
        };
        let Some((rva, size)) = field_rva_data(module, data_field) else {
            continue;
        };
        if size <= PAYLOAD_MIN_SIZE {
            continue;
        }

        return Ok(Some(DecoderBinding {
            type_token: cil_type.token,
            type_fullname: cil_type.fullname(),
            payload_field: field.name.clone(),
            payload_rva: rva,
            payload_size: size,
            table_text: find_table_text(cil_type),
        }));
    }

    Ok(None)
}

/// Resolves a method of `cil_type` by exact name.
fn type_method_by_name(module: &Module, cil_type: &CilType, name: &str) -> Option<MethodRc> {
    for (_, method_ref) in cil_type.methods.iter() {
        let Some(token) = method_ref.token() else {
            continue;
        };
        if let Some(entry) = module.object().methods().get(&token) {
            let method = entry.value();
            if method.name == name {
                return Some(method.clone());
            }
        }
    }
    None
}

/// Scans a static initializer for the `ldtoken <data>; …; stsfld <field>`
/// array-initialization pattern and returns the token-loaded field.
///
/// The token load and the store are separated by the runtime initializer
/// call, so the scan remembers the most recent field `ldtoken` and resolves
/// it when the matching `stsfld` appears.
fn backing_field_token(cctor: &Method, payload_field: Token) -> Option<Token> {
    let mut pending: Option<Token> = None;

    for instruction in cctor.instructions() {
        match (instruction.mnemonic, &instruction.operand) {
            ("ldtoken", Operand::Token(token)) if token.table() == 0x04 => {
                pending = Some(*token);
            }
            ("stsfld", Operand::Token(token)) if *token == payload_field => {
                return pending;
            }
            _ => {}
        }
    }

    None
}

/// Looks up the `FieldRVA` row of `field_token` and the size of its backing
/// data, giving the location of the initializer blob in the image.
fn field_rva_data(module: &Module, field_token: Token) -> Option<(u32, usize)> {
    let tables = module.object().tables()?;
    let rva_table = tables.table::<FieldRvaRaw>()?;

    let rid = field_token.row();
    let row = rva_table.iter().find(|r| r.field == rid)?;
    if row.rva == 0 {
        return None;
    }

    let size = field_data_size(module, rid)?;
    Some((row.rva, size))
}

/// Size of a field's RVA-backed data.
///
/// RVA-backed initializer fields are typed as a compiler-generated value
/// type whose `ClassLayout` row carries the explicit data size.
fn field_data_size(module: &Module, field_rid: u32) -> Option<usize> {
    let tables = module.object().tables()?;
    let blobs = module.object().blob()?;

    let field_table = tables.table::<FieldRaw>()?;
    let field_row = field_table.get(field_rid)?;

    let signature_data = blobs.get(field_row.signature as usize).ok()?;
    let field_signature = parse_field_signature(signature_data).ok()?;

    match &field_signature.base {
        TypeSignature::ValueType(token) => {
            // Only TypeDef tokens have ClassLayout entries.
            if token.table() != 0x02 {
                return None;
            }
            let type_rid = token.row();

            let layout_table = tables.table::<ClassLayoutRaw>()?;
            layout_table
                .iter()
                .find(|layout| layout.parent == type_rid)
                .map(|layout| layout.class_size as usize)
        }
        _ => None,
    }
}

/// Looks for the optional lookup-table field: a static `string` or
/// `string[]` field whose constant default carries the newline-delimited
/// record table.
fn find_table_text(cil_type: &CilType) -> Option<String> {
    for (_, field) in cil_type.fields.iter() {
        if field.flags & FIELD_STATIC == 0 {
            continue;
        }
        if !is_string_like(&field.signature.base) {
            continue;
        }
        if let Some(constant) = field.default.get() {
            if let CilPrimitiveData::String(text) = &constant.data {
                return Some(text.clone());
            }
        }
    }
    None
}

fn is_byte_array(signature: &TypeSignature) -> bool {
    matches!(signature, TypeSignature::SzArray(array) if matches!(*array.base, TypeSignature::U1))
}

fn is_string_like(signature: &TypeSignature) -> bool {
    match signature {
        TypeSignature::String => true,
        TypeSignature::SzArray(array) => matches!(*array.base, TypeSignature::String),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use dotscope::metadata::signatures::SignatureSzArray;

    use super::*;

    fn byte_array_signature() -> TypeSignature {
        TypeSignature::SzArray(SignatureSzArray {
            modifiers: Vec::new(),
            base: Box::new(TypeSignature::U1),
        })
    }

    #[test]
    fn byte_array_detection() {
        assert!(is_byte_array(&byte_array_signature()));
        assert!(!is_byte_array(&TypeSignature::String));
        assert!(!is_byte_array(&TypeSignature::SzArray(SignatureSzArray {
            modifiers: Vec::new(),
            base: Box::new(TypeSignature::I4),
        })));
    }

    #[test]
    fn string_like_detection() {
        assert!(is_string_like(&TypeSignature::String));
        assert!(is_string_like(&TypeSignature::SzArray(SignatureSzArray {
            modifiers: Vec::new(),
            base: Box::new(TypeSignature::String),
        })));
        assert!(!is_string_like(&byte_array_signature()));
    }

    #[test]
    fn system_namespaces_are_skipped() {
        assert!(is_system_namespace("System"));
        assert!(is_system_namespace("System.Reflection"));
        assert!(!is_system_namespace("SystemX"));
        assert!(!is_system_namespace("Obfuscated"));
    }
}
