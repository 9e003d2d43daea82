//! Per-compilation optimization counters.
//!
//! Consulted by tests and surfaced through `tracing` debug events when a compilation finishes.
//! Purely informational; nothing reads these to make decisions.

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OptStats {
    pub ops_in: usize,
    pub ops_emitted: usize,
    pub constants_folded: usize,
    pub pure_cse_hits: usize,
    pub heap_reads_elided: usize,
    pub dead_stores_elided: usize,
    pub guards_emitted: usize,
    pub guards_elided: usize,
    pub virtuals_created: usize,
    pub virtuals_forced: usize,
}

impl OptStats {
    pub fn log_summary(&self, what: &str) {
        tracing::debug!(
            target: "ember_jit::opt",
            what,
            ops_in = self.ops_in,
            ops_emitted = self.ops_emitted,
            constants_folded = self.constants_folded,
            pure_cse_hits = self.pure_cse_hits,
            heap_reads_elided = self.heap_reads_elided,
            dead_stores_elided = self.dead_stores_elided,
            guards_emitted = self.guards_emitted,
            guards_elided = self.guards_elided,
            virtuals_created = self.virtuals_created,
            virtuals_forced = self.virtuals_forced,
            "optimization pass finished"
        );
    }
}
