// Adapters
//
// Readers for concrete on-disk event log formats.

pub mod jsonl;
