//! Thin facade over the metadata library.
//!
//! [`Module`] owns the loaded [`CilObject`] for the analysis phases and knows
//! how to materialize a [`PatchSet`] into an output file through the
//! modification API. No transformation logic lives here: the rewriter
//! decides *what* to patch, this module decides *how* bytes reach disk.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use dotscope::{
    metadata::{
        method::MethodBody,
        tables::{MethodDefRaw, TableDataOwned, TableId},
        token::Token,
    },
    CilAssembly, CilObject, ValidationConfig,
};

use crate::{Error, Result};

/// Opcode byte of `ldstr`.
pub(crate) const LDSTR_OPCODE: u8 = 0x72;

/// Width of `call`, `callvirt`, and `ldstr`: one opcode byte plus a 4-byte
/// metadata token. The rewriter relies on all three having the same width.
pub(crate) const CALL_WIDTH: usize = 5;

/// Token high byte selecting the `#US` (user string) heap.
const USERSTRING_TABLE: u32 = 0x7000_0000;

// Method-body extra-section flags, ECMA-335 II.25.4.5.
const SECT_EHTABLE: u8 = 0x01;
const SECT_FAT_FORMAT: u8 = 0x40;
const SECT_MORE_SECTS: u8 = 0x80;

/// A loaded managed module plus the path it came from.
pub struct Module {
    path: PathBuf,
    object: CilObject,
}

impl Module {
    /// Loads a module from disk with the analysis validation preset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Load`] when the file is missing, not a .NET PE, or
    /// its metadata cannot be parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let object = CilObject::from_path_with_validation(path, ValidationConfig::analysis())
            .map_err(Error::Load)?;

        Ok(Module {
            path: path.to_path_buf(),
            object,
        })
    }

    /// The path the module was loaded from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Metadata access for the analysis phases.
    #[must_use]
    pub fn object(&self) -> &CilObject {
        &self.object
    }

    /// Reads `size` bytes at `rva` from the module image.
    pub(crate) fn bytes_at_rva(&self, rva: u32, size: usize) -> Result<&[u8]> {
        let offset = self.object.file().rva_to_offset(rva as usize)?;
        Ok(self.object.file().data_slice(offset, size)?)
    }

    /// Raw bytes of one method body: header, IL code, and any trailing
    /// exception handler sections.
    pub(crate) fn method_body_bytes(&self, rva: u32) -> Result<Vec<u8>> {
        let offset = self.object.file().rva_to_offset(rva as usize)?;
        let data = self.object.file().data();
        let slice = data.get(offset..).ok_or_else(|| Error::Body {
            rva,
            message: "body offset past end of image".to_string(),
        })?;

        let body = MethodBody::from(slice)?;
        let total = body_total_size(slice, &body);
        slice
            .get(..total)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Error::Body {
                rva,
                message: "truncated method body".to_string(),
            })
    }

    /// IL code bytes of one method body, without header or trailing sections.
    pub(crate) fn method_code_bytes(&self, rva: u32) -> Result<Vec<u8>> {
        let offset = self.object.file().rva_to_offset(rva as usize)?;
        let data = self.object.file().data();
        let slice = data.get(offset..).ok_or_else(|| Error::Body {
            rva,
            message: "body offset past end of image".to_string(),
        })?;

        let body = MethodBody::from(slice)?;
        slice
            .get(body.size_header..body.size_header + body.size_code)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Error::Body {
                rva,
                message: "truncated method body".to_string(),
            })
    }

    /// Writes the module to `out` with every substitution in `patches`
    /// applied.
    ///
    /// Each replacement literal is interned once in the `#US` heap, every
    /// touched method body is rebuilt from its original bytes with the
    /// same-width `call → ldstr` substitutions applied, stored through the
    /// modification API, and its `MethodDef` row retargeted. Untouched
    /// structures and all metadata tokens round-trip unchanged. An empty
    /// patch set degenerates to a clean round-trip of the input.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Write`] when the modified assembly cannot be
    /// generated or written, and [`Error::Body`] when a body slated for
    /// patching cannot be re-read from the image.
    pub fn write_patched(&self, patches: &PatchSet, out: &Path) -> Result<()> {
        let mut assembly = CilAssembly::from_bytes_with_validation(
            self.object.file().data().to_vec(),
            ValidationConfig::analysis(),
        )
        .map_err(Error::Write)?;

        let mut literal_tokens = Vec::with_capacity(patches.literals.len());
        for literal in &patches.literals {
            let change_ref = assembly.userstring_add(literal).map_err(Error::Write)?;
            literal_tokens.push(USERSTRING_TABLE | change_ref.placeholder());
        }

        for patch in &patches.methods {
            let mut body_bytes = self.method_body_bytes(patch.rva)?;
            let header_size = MethodBody::from(&body_bytes)?.size_header;

            for sub in &patch.subs {
                let at = header_size + sub.code_offset;
                let window = body_bytes.get_mut(at..at + CALL_WIDTH).ok_or_else(|| {
                    Error::Body {
                        rva: patch.rva,
                        message: format!("patch at code offset {} out of range", sub.code_offset),
                    }
                })?;
                window[0] = LDSTR_OPCODE;
                window[1..CALL_WIDTH]
                    .copy_from_slice(&literal_tokens[sub.literal].to_le_bytes());
            }

            let placeholder_rva = assembly.store_method_body(body_bytes);

            let rid = patch.token.row();
            let existing_row = assembly
                .view()
                .tables()
                .and_then(|t| t.table::<MethodDefRaw>())
                .and_then(|table| table.get(rid))
                .ok_or_else(|| Error::Body {
                    rva: patch.rva,
                    message: format!("MethodDef row {rid} not found"),
                })?;

            let updated_row = MethodDefRaw {
                rid: existing_row.rid,
                token: existing_row.token,
                offset: existing_row.offset,
                rva: placeholder_rva,
                impl_flags: existing_row.impl_flags,
                flags: existing_row.flags,
                name: existing_row.name,
                signature: existing_row.signature,
                param_list: existing_row.param_list,
            };

            assembly
                .table_row_update(TableId::MethodDef, rid, TableDataOwned::MethodDef(updated_row))
                .map_err(Error::Write)?;
        }

        assembly.to_file(out).map_err(Error::Write)?;
        Ok(())
    }
}

/// One `call → ldstr` substitution inside a method body.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Substitution {
    /// Byte offset of the patched instruction within the method's IL code.
    pub code_offset: usize,
    /// Index into the patch set's literal table.
    pub literal: usize,
}

/// All substitutions planned for one method body.
#[derive(Debug)]
pub(crate) struct MethodPatch {
    /// MethodDef token of the body.
    pub token: Token,
    /// RVA of the body in the input image.
    pub rva: u32,
    /// Substitutions in code order.
    pub subs: Vec<Substitution>,
}

/// The rewriter's output: interned literals plus per-method substitutions.
///
/// Built once by [`rewrite_call_sites`](crate::rewriter::rewrite_call_sites)
/// and read-only afterwards; consumed by [`Module::write_patched`] and
/// replayed by the verifier.
#[derive(Debug, Default)]
pub struct PatchSet {
    literals: Vec<String>,
    interned: HashMap<String, usize>,
    methods: Vec<MethodPatch>,
    by_token: HashMap<Token, usize>,
}

impl PatchSet {
    /// True when no substitutions were planned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Number of distinct literals to intern.
    #[must_use]
    pub fn literal_count(&self) -> usize {
        self.literals.len()
    }

    /// Number of method bodies with at least one substitution.
    #[must_use]
    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    /// Interns `literal`, returning its table index. Duplicates share one
    /// `#US` heap entry.
    pub(crate) fn intern(&mut self, literal: &str) -> usize {
        if let Some(&index) = self.interned.get(literal) {
            return index;
        }
        let index = self.literals.len();
        self.literals.push(literal.to_string());
        self.interned.insert(literal.to_string(), index);
        index
    }

    pub(crate) fn push_method(&mut self, patch: MethodPatch) {
        self.by_token.insert(patch.token, self.methods.len());
        self.methods.push(patch);
    }

    /// Applies this set's substitutions for `token` to a copy of its IL
    /// code, so the verifier can decode bodies as they will appear in the
    /// output. The interned literal index stands in for the final heap
    /// offset; only the opcode matters to the verifier.
    pub(crate) fn apply_to_code(&self, token: Token, mut code: Vec<u8>) -> Vec<u8> {
        let Some(&index) = self.by_token.get(&token) else {
            return code;
        };

        for sub in &self.methods[index].subs {
            if let Some(window) = code.get_mut(sub.code_offset..sub.code_offset + CALL_WIDTH) {
                let stand_in = USERSTRING_TABLE | (sub.literal as u32 + 1);
                window[0] = LDSTR_OPCODE;
                window[1..CALL_WIDTH].copy_from_slice(&stand_in.to_le_bytes());
            }
        }
        code
    }
}

/// Full byte length of a method body, including alignment padding and
/// trailing exception handler sections.
///
/// Mirrors the extra-section walk of the body parser: sections start at the
/// next 4-byte boundary after the IL code, each section's length field
/// includes its own 4-byte header, and the chain continues while the
/// more-sections flag is set.
fn body_total_size(data: &[u8], body: &MethodBody) -> usize {
    let mut end = body.size();
    if !body.is_exception_data {
        return end;
    }

    let mut cursor = (end + 3) & !3;
    while cursor + 4 <= data.len() {
        let flags = data[cursor];
        if flags & SECT_EHTABLE == 0 {
            break;
        }

        let section_size = if flags & SECT_FAT_FORMAT != 0 {
            u32::from_le_bytes([data[cursor + 1], data[cursor + 2], data[cursor + 3], 0]) as usize
        } else {
            data[cursor + 1] as usize
        };
        if section_size < 4 || cursor + section_size > data.len() {
            break;
        }

        cursor += section_size;
        end = cursor;

        if flags & SECT_MORE_SECTS == 0 {
            break;
        }
        cursor = (cursor + 3) & !3;
    }

    end
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a tiny-format body: 1 header byte, code length in the upper
    /// six bits.
    fn tiny_body(code: &[u8]) -> Vec<u8> {
        assert!(code.len() < 64);
        let mut data = vec![0x02 | ((code.len() as u8) << 2)];
        data.extend_from_slice(code);
        data
    }

    /// Builds a fat-format body with one small-form exception section
    /// holding `handlers` entries.
    fn fat_body_with_handlers(code: &[u8], handlers: usize) -> Vec<u8> {
        let mut data = Vec::new();
        // Fat header: 12-byte header nibble + fat format + more-sections
        // flag, max stack 8, code size, no locals signature.
        let flags: u16 = 0x3003 | 0x0008;
        data.extend_from_slice(&flags.to_le_bytes());
        data.extend_from_slice(&8u16.to_le_bytes());
        data.extend_from_slice(&(code.len() as u32).to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(code);

        while data.len() % 4 != 0 {
            data.push(0);
        }

        let section_size = 4 + handlers * 12;
        data.push(SECT_EHTABLE);
        data.push(section_size as u8);
        data.extend_from_slice(&[0, 0]);
        for _ in 0..handlers {
            data.extend_from_slice(&[0u8; 12]);
        }
        data
    }

    #[test]
    fn total_size_tiny() {
        let data = tiny_body(&[0x00, 0x2A]);
        let body = MethodBody::from(&data).unwrap();
        assert_eq!(body_total_size(&data, &body), data.len());
    }

    #[test]
    fn total_size_fat_with_exception_section() {
        let code = [0x00, 0x00, 0x00, 0x00, 0x2A];
        let data = fat_body_with_handlers(&code, 2);
        let body = MethodBody::from(&data).unwrap();
        assert!(body.is_exception_data);
        assert_eq!(body_total_size(&data, &body), data.len());
    }

    #[test]
    fn total_size_ignores_trailing_garbage() {
        let code = [0x00, 0x2A];
        let mut data = fat_body_with_handlers(&code, 1);
        let expected = data.len();
        data.extend_from_slice(&[0xCC; 16]);
        let body = MethodBody::from(&data).unwrap();
        assert_eq!(body_total_size(&data, &body), expected);
    }

    #[test]
    fn intern_deduplicates() {
        let mut patches = PatchSet::default();
        let a = patches.intern("alpha");
        let b = patches.intern("beta");
        let a2 = patches.intern("alpha");
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(patches.literal_count(), 2);
    }

    #[test]
    fn apply_to_code_rewrites_call_bytes() {
        let mut patches = PatchSet::default();
        let literal = patches.intern("hello");
        let token = Token::new(0x0600_0001);
        patches.push_method(MethodPatch {
            token,
            rva: 0x2000,
            subs: vec![Substitution {
                code_offset: 1,
                literal,
            }],
        });

        // nop; call 0x06000002; ret
        let code = vec![0x00, 0x28, 0x02, 0x00, 0x00, 0x06, 0x2A];
        let patched = patches.apply_to_code(token, code.clone());

        assert_eq!(patched[0], 0x00);
        assert_eq!(patched[1], LDSTR_OPCODE);
        assert_eq!(patched[6], 0x2A);
        assert_eq!(patched.len(), code.len());

        // Methods outside the set come back untouched.
        let other = patches.apply_to_code(Token::new(0x0600_0009), code.clone());
        assert_eq!(other, code);
    }
}
