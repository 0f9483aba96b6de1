//! Drives the deobfuscation phases in order.
//!
//! The pipeline is side-effect-free: it analyzes the module and plans the
//! rewrite, but writing is left to the caller so dry runs and diagnostics
//! share the same path. Phases run to completion in a fixed order (locate,
//! extract, decrypt, analyze, rewrite, verify), iterating types in
//! enumeration order and methods in declaration order, so output is
//! bit-reproducible for a given input.

use log::{debug, info, warn};

use crate::{
    accessors::analyze_accessors,
    locator::locate_decoder,
    module::{Module, PatchSet},
    payload::{decrypt_in_place, extract_payload},
    rewriter::rewrite_call_sites,
    verifier::count_residual_calls,
    Result,
};

/// Statistics of one pipeline run.
#[derive(Debug, Default, Clone)]
pub struct PipelineReport {
    /// Fully qualified decoder type name; `None` when no decoder was found.
    pub decoder_type: Option<String>,
    /// Size of the encrypted payload in bytes.
    pub payload_size: usize,
    /// Accessors whose literal was recovered.
    pub accessors_recovered: usize,
    /// Decoder methods skipped by predicate, pattern, bounds, or UTF-8.
    pub accessors_skipped: usize,
    /// Lookup-table records decoded (table path only).
    pub table_records_recovered: usize,
    /// Lookup-table records skipped as malformed (table path only).
    pub table_records_skipped: usize,
    /// Methods with at least one substituted call site.
    pub methods_patched: usize,
    /// Total substituted call sites.
    pub calls_replaced: usize,
    /// Decoder calls remaining after the rewrite; non-zero is a warning.
    pub residual_calls: usize,
}

impl PipelineReport {
    /// True when a decoder type was bound.
    #[must_use]
    pub fn decoder_found(&self) -> bool {
        self.decoder_type.is_some()
    }
}

/// Report plus the planned substitutions.
#[derive(Debug, Default)]
pub struct PipelineOutcome {
    /// Statistics for display and machine output.
    pub report: PipelineReport,
    /// Substitutions to hand to [`Module::write_patched`]. Empty when no
    /// decoder was found or nothing was replaced; writing an empty set
    /// round-trips the module unchanged.
    pub patches: PatchSet,
}

/// Runs analysis and rewriting over a loaded module.
///
/// No decoder is a clean outcome: the report carries no decoder name, the
/// patch set is empty, and the caller may still write the module through
/// for an unchanged round-trip.
///
/// # Errors
///
/// Fails on payload extraction or body re-read problems; per-accessor and
/// per-record failures only increment the report counters.
pub fn run(module: &Module) -> Result<PipelineOutcome> {
    let Some(binding) = locate_decoder(module)? else {
        info!("no string decoder detected");
        return Ok(PipelineOutcome::default());
    };

    info!(
        "decoder type {} (payload field `{}`, {} bytes)",
        binding.type_fullname, binding.payload_field, binding.payload_size
    );

    let mut payload = extract_payload(module, &binding)?;
    decrypt_in_place(&mut payload);

    let analysis = analyze_accessors(module, &binding, &payload);
    drop(payload);
    debug!(
        "{} literal(s) recovered, {} accessor(s) skipped",
        analysis.map.len(),
        analysis.stats.accessors_skipped
    );

    let rewrite = rewrite_call_sites(module, &binding, &analysis.map)?;

    let residual = count_residual_calls(module, &binding, &rewrite.patches)?;
    if residual > 0 {
        warn!("{residual} decoder call(s) could not be replaced");
    }

    Ok(PipelineOutcome {
        report: PipelineReport {
            decoder_type: Some(binding.type_fullname),
            payload_size: binding.payload_size,
            accessors_recovered: analysis.stats.accessors_recovered,
            accessors_skipped: analysis.stats.accessors_skipped,
            table_records_recovered: analysis.stats.table_records_recovered,
            table_records_skipped: analysis.stats.table_records_skipped,
            methods_patched: rewrite.stats.methods_patched,
            calls_replaced: rewrite.stats.calls_replaced,
            residual_calls: residual,
        },
        patches: rewrite.patches,
    })
}
