//! Recovers string literals from the decoder's accessor methods.
//!
//! Two decode paths exist. The common one reads each accessor's instruction
//! stream: an accessor loads `(index, offset, length)` as three integer
//! constants and calls a shared fetch helper, so the constants immediately
//! preceding the first call pinpoint the string inside the decrypted
//! payload. The alternative path, selected when the decoder carries a
//! lookup-table field, parses that table's newline-delimited records
//! instead.
//!
//! Per-accessor failures (unexpected instruction shapes, out-of-range
//! slices, invalid UTF-8) skip the accessor and are counted; they never
//! abort the run.

use std::collections::HashMap;

use dotscope::{
    assembly::{Immediate, Instruction, Operand},
    metadata::{method::Method, signatures::TypeSignature},
};
use log::debug;

use crate::{locator::DecoderBinding, module::Module};

/// Mapping from accessor method name to its recovered string literal.
///
/// Keys are the exact names as they appear in metadata, unique within the
/// decoder type; look-ups are by exact string equality. Built in one phase
/// and read-only afterwards.
#[derive(Debug, Default)]
pub struct AccessorMap {
    entries: HashMap<String, String>,
}

impl AccessorMap {
    /// The literal recovered for `name`, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    /// Number of recovered literals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing was recovered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over `(accessor name, literal)` pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, text)| (name.as_str(), text.as_str()))
    }

    fn insert(&mut self, name: String, text: String) {
        self.entries.insert(name, text);
    }
}

/// Counters kept while analyzing accessors.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnalysisStats {
    /// Accessors whose literal was recovered.
    pub accessors_recovered: usize,
    /// Decoder methods that failed the accessor predicate or whose pattern,
    /// bounds, or UTF-8 check failed.
    pub accessors_skipped: usize,
    /// Lookup-table records decoded successfully.
    pub table_records_recovered: usize,
    /// Lookup-table records skipped as malformed or out of range.
    pub table_records_skipped: usize,
}

/// Result of the accessor analysis phase.
#[derive(Debug, Default)]
pub struct Analysis {
    /// The recovered name → literal mapping.
    pub map: AccessorMap,
    /// Phase counters for the report.
    pub stats: AnalysisStats,
}

/// Builds the [`AccessorMap`] for a bound decoder over its decrypted
/// payload.
///
/// The payload must already be decrypted. A lookup-table binding takes the
/// table path; otherwise every method of the decoder type is tested against
/// the accessor predicate and pattern-matched.
#[must_use]
pub fn analyze_accessors(module: &Module, binding: &DecoderBinding, payload: &[u8]) -> Analysis {
    let mut analysis = Analysis::default();

    if let Some(table) = &binding.table_text {
        analyze_table(table, payload, &mut analysis);
        return analysis;
    }

    let Some(decoder_type) = module.object().types().get(&binding.type_token) else {
        return analysis;
    };

    for (_, method_ref) in decoder_type.methods.iter() {
        let Some(token) = method_ref.token() else {
            continue;
        };
        let Some(entry) = module.object().methods().get(&token) else {
            continue;
        };
        let method = entry.value();

        if !is_accessor(method) {
            analysis.stats.accessors_skipped += 1;
            continue;
        }

        let instructions: Vec<&Instruction> = method.instructions().collect();
        let recovered = recover_range(&instructions)
            .and_then(|(offset, length)| decode_slice(payload, offset, length));

        match recovered {
            Some(text) => {
                analysis.map.insert(method.name.clone(), text);
                analysis.stats.accessors_recovered += 1;
            }
            None => {
                debug!("accessor {} skipped", method.name);
                analysis.stats.accessors_skipped += 1;
            }
        }
    }

    analysis
}

/// The accessor predicate: parameterless, string-returning, non-constructor,
/// with a body.
fn is_accessor(method: &Method) -> bool {
    if method.name == ".ctor" || method.name == ".cctor" {
        return false;
    }
    if !method.signature.params.is_empty() {
        return false;
    }
    if method.signature.return_type.base != TypeSignature::String {
        return false;
    }
    method.body.get().is_some()
}

/// Finds the first `call`/`callvirt` and reads the three instructions
/// immediately before it as `(index, offset, length)` constant loads.
///
/// Only `offset` and `length` are returned; the leading constant merely
/// confirms the shape. Any non-constant opcode in the window, or fewer than
/// three preceding instructions, invalidates the match.
fn recover_range(instructions: &[&Instruction]) -> Option<(i32, i32)> {
    let call_index = instructions
        .iter()
        .position(|instruction| is_call_mnemonic(instruction.mnemonic))?;
    if call_index < 3 {
        return None;
    }

    let _index = ldc_i4_value(instructions[call_index - 3])?;
    let offset = ldc_i4_value(instructions[call_index - 2])?;
    let length = ldc_i4_value(instructions[call_index - 1])?;

    Some((offset, length))
}

fn is_call_mnemonic(mnemonic: &str) -> bool {
    mnemonic == "call" || mnemonic == "callvirt"
}

/// Decodes one `ldc.i4*` instruction to its constant.
///
/// Covers the dedicated `ldc.i4.0` … `ldc.i4.8` and `ldc.i4.m1` opcodes,
/// the short 8-bit form, and the full 32-bit form. Anything else is not a
/// recognized constant load.
fn ldc_i4_value(instruction: &Instruction) -> Option<i32> {
    match instruction.mnemonic {
        "ldc.i4.m1" => Some(-1),
        "ldc.i4.0" => Some(0),
        "ldc.i4.1" => Some(1),
        "ldc.i4.2" => Some(2),
        "ldc.i4.3" => Some(3),
        "ldc.i4.4" => Some(4),
        "ldc.i4.5" => Some(5),
        "ldc.i4.6" => Some(6),
        "ldc.i4.7" => Some(7),
        "ldc.i4.8" => Some(8),
        "ldc.i4.s" => match instruction.operand {
            Operand::Immediate(Immediate::Int8(value)) => Some(i32::from(value)),
            _ => None,
        },
        "ldc.i4" => match instruction.operand {
            Operand::Immediate(Immediate::Int32(value)) => Some(value),
            _ => None,
        },
        _ => None,
    }
}

/// Slices `payload[offset .. offset + length]` and decodes it as strict
/// UTF-8. `offset + length == payload.len()` is accepted; one past is not.
fn decode_slice(payload: &[u8], offset: i32, length: i32) -> Option<String> {
    if offset < 0 || length < 0 {
        return None;
    }

    let start = offset as usize;
    let end = start.checked_add(length as usize)?;
    if end > payload.len() {
        return None;
    }

    std::str::from_utf8(&payload[start..end])
        .ok()
        .map(str::to_owned)
}

/// Parses the lookup table: newline-delimited records of the form
/// `id,_,_,offset,length`. The header record (first field literally
/// `StringID`) is skipped; malformed records are counted and skipped.
/// Recovered entries are keyed `_String_<id>`; ids are not cross-checked
/// against existing accessor methods.
fn analyze_table(table: &str, payload: &[u8], analysis: &mut Analysis) {
    for line in table.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split(',').collect();
        if fields[0] == "StringID" {
            continue;
        }
        if fields.len() < 5 {
            analysis.stats.table_records_skipped += 1;
            continue;
        }

        let range = fields[3]
            .trim()
            .parse::<i32>()
            .ok()
            .zip(fields[4].trim().parse::<i32>().ok());
        let recovered =
            range.and_then(|(offset, length)| decode_slice(payload, offset, length));

        match recovered {
            Some(text) => {
                analysis.map.insert(format!("_String_{}", fields[0]), text);
                analysis.stats.table_records_recovered += 1;
            }
            None => analysis.stats.table_records_skipped += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use dotscope::{
        assembly::{FlowType, InstructionCategory, StackBehavior},
        metadata::token::Token,
    };

    use super::*;

    fn instruction(mnemonic: &'static str, operand: Operand) -> Instruction {
        let flow_type = if is_call_mnemonic(mnemonic) {
            FlowType::Call
        } else {
            FlowType::Sequential
        };

        Instruction {
            rva: 0,
            offset: 0,
            size: 1,
            opcode: 0,
            prefix: 0,
            mnemonic,
            category: InstructionCategory::Misc,
            flow_type,
            operand,
            stack_behavior: StackBehavior {
                pops: 0,
                pushes: 0,
                net_effect: 0,
            },
            branch_targets: Vec::new(),
        }
    }

    fn plain(mnemonic: &'static str) -> Instruction {
        instruction(mnemonic, Operand::None)
    }

    fn ldc_s(value: i8) -> Instruction {
        instruction("ldc.i4.s", Operand::Immediate(Immediate::Int8(value)))
    }

    fn ldc_wide(value: i32) -> Instruction {
        instruction("ldc.i4", Operand::Immediate(Immediate::Int32(value)))
    }

    fn call() -> Instruction {
        instruction("call", Operand::Token(Token::new(0x0600_0001)))
    }

    fn recover(instructions: &[Instruction]) -> Option<(i32, i32)> {
        let refs: Vec<&Instruction> = instructions.iter().collect();
        recover_range(&refs)
    }

    #[test]
    fn short_form_constants_decode() {
        assert_eq!(ldc_i4_value(&plain("ldc.i4.m1")), Some(-1));
        assert_eq!(ldc_i4_value(&plain("ldc.i4.0")), Some(0));
        assert_eq!(ldc_i4_value(&plain("ldc.i4.8")), Some(8));
        assert_eq!(ldc_i4_value(&ldc_s(-100)), Some(-100));
        assert_eq!(ldc_i4_value(&ldc_wide(0x0001_0000)), Some(0x0001_0000));
        assert_eq!(ldc_i4_value(&plain("nop")), None);
        assert_eq!(ldc_i4_value(&plain("ldc.r4")), None);
    }

    #[test]
    fn range_recovered_from_constant_window() {
        let body = [plain("ldc.i4.0"), plain("ldc.i4.0"), ldc_wide(13), call(), plain("ret")];
        assert_eq!(recover(&body), Some((0, 13)));
    }

    #[test]
    fn virtual_call_is_recognized() {
        let body = [
            plain("ldc.i4.2"),
            ldc_s(10),
            ldc_wide(64),
            instruction("callvirt", Operand::Token(Token::new(0x0600_0002))),
            plain("ret"),
        ];
        assert_eq!(recover(&body), Some((10, 64)));
    }

    #[test]
    fn short_window_is_rejected() {
        let body = [plain("ldc.i4.0"), plain("ldc.i4.5"), call(), plain("ret")];
        assert_eq!(recover(&body), None);

        let body = [call(), plain("ret")];
        assert_eq!(recover(&body), None);
    }

    #[test]
    fn foreign_opcode_in_window_is_rejected() {
        let body = [plain("ldc.i4.0"), plain("ldloc.0"), ldc_wide(13), call(), plain("ret")];
        assert_eq!(recover(&body), None);
    }

    #[test]
    fn first_call_wins() {
        // Later calls are never considered; an unusable first window loses
        // the accessor even if a later call has a clean one.
        let body = [
            plain("nop"),
            plain("nop"),
            plain("nop"),
            call(),
            plain("ldc.i4.1"),
            plain("ldc.i4.2"),
            plain("ldc.i4.3"),
            call(),
        ];
        assert_eq!(recover(&body), None);
    }

    #[test]
    fn slice_bounds_are_inclusive_at_the_end() {
        let payload = b"alphabet";
        assert_eq!(decode_slice(payload, 0, 8).as_deref(), Some("alphabet"));
        assert_eq!(decode_slice(payload, 0, 9), None);
        assert_eq!(decode_slice(payload, 5, 3).as_deref(), Some("bet"));
        assert_eq!(decode_slice(payload, 8, 0).as_deref(), Some(""));
    }

    #[test]
    fn negative_and_overflowing_ranges_are_rejected() {
        let payload = b"alphabet";
        assert_eq!(decode_slice(payload, -1, 4), None);
        assert_eq!(decode_slice(payload, 0, -1), None);
        assert_eq!(decode_slice(payload, i32::MAX, i32::MAX), None);
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let payload = [0x66, 0x6F, 0xFF, 0xFE];
        assert_eq!(decode_slice(&payload, 0, 4), None);
        assert_eq!(decode_slice(&payload, 0, 2).as_deref(), Some("fo"));
    }

    #[test]
    fn table_records_decode() {
        let mut analysis = Analysis::default();
        let table = "StringID,_,_,offset,length\nX,,,0,3\nY,,,3,4\n";
        analyze_table(table, b"foobarz", &mut analysis);

        assert_eq!(analysis.map.get("_String_X"), Some("foo"));
        assert_eq!(analysis.map.get("_String_Y"), Some("barz"));
        assert_eq!(analysis.stats.table_records_recovered, 2);
        assert_eq!(analysis.stats.table_records_skipped, 0);
    }

    #[test]
    fn malformed_table_records_are_counted_not_fatal() {
        let mut analysis = Analysis::default();
        let table = "A,,,0,3\nshort,line\nB,,,x,4\nC,,,4,400\nD,,,3,4\n";
        analyze_table(table, b"foobarz", &mut analysis);

        assert_eq!(analysis.map.get("_String_A"), Some("foo"));
        assert_eq!(analysis.map.get("_String_D"), Some("barz"));
        assert_eq!(analysis.stats.table_records_recovered, 2);
        assert_eq!(analysis.stats.table_records_skipped, 3);
    }
}
