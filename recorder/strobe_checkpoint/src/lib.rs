//! Strobe checkpoint serialization engine.
//!
//! Periodically emits a self-contained, deduplicated snapshot of every
//! constant metadata artifact (types, members, loaders, interned strings)
//! referenced by trace events since the previous snapshot. Consumers
//! resolve per-event numeric references against these checkpoints instead
//! of re-embedding metadata in every event.
//!
//! Artifacts form an acyclic dependency graph and are discovered lazily,
//! while other artifacts serialize: writing a type records its loader for
//! the loader stage, and every record write interns names for the string
//! stage. The engine computes that transitive closure in one ordered
//! single pass — no separate graph-building step — deduplicates within
//! the checkpoint, assigns compact per-checkpoint ordinals, and resets all
//! tag state afterwards.
//!
//! Entry point: [`CheckpointSerializer::write`].

mod artifacts;
mod emit;
mod predicate;
mod serializer;
mod writer;

pub use artifacts::{ArtifactRegistry, RegistryError, BOOT_LOADER_NAME, BOOT_NAME_HASH};
pub use emit::{
    both, guard, member_key, write_loader_record, write_member_record, write_text_record,
    write_type_record, CheckpointContext, Stream,
};
pub use predicate::{
    AnyUsedPredicate, LeakPredicate, MemberPredicate, MembersPredicate, UniquePredicate,
    UsedPredicate,
};
pub use serializer::CheckpointSerializer;
pub use writer::{ArtifactKind, BlockToken, CheckpointWriter};
