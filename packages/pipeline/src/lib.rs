//! CarbonPlane: Ingestion Pipeline, Calculation Engine & Allocation Engine
//!
//! The write path of the plane. Measurements from manual forms, CSV bulk
//! uploads, polled HTTP APIs and streaming IoT devices are normalised,
//! validated, deduplicated and persisted with per-stream running
//! aggregates, then converted to per-gas emissions by a closed dispatch
//! table of pure calculators, and finally partitioned across process nodes
//! by the allocation engine.

pub mod allocation;
pub mod calc;
pub mod csvio;
pub mod entry;
pub mod ingest;
pub mod normalize;
pub mod poller;
pub mod store;
pub mod timeparse;
pub mod worker;

pub use allocation::{allocate, AllocationResult, NodeAllocation};
pub use calc::{CalcError, CalculationEngine};
pub use csvio::{emit_csv, parse_csv, CsvError, CsvParse, CsvRow};
pub use entry::{
    resequence, CalculatedEmissions, MeasurementEntry, ProcessingStatus, StreamKey, SummaryPeriod,
};
pub use ingest::{
    IngestError, IngestInput, IngestReport, Ingestor, RawEntry, RowFailure, StreamLocks,
};
pub use normalize::{normalize_payload, sanitise_field, ActivityKind};
pub use poller::{ApiPoller, PollOutcome};
pub use store::{EntryStore, InMemoryEntryStore};
pub use timeparse::{parse_entry_timestamp, TimeParseError};
pub use worker::{CalcWorker, WorkerConfig};
