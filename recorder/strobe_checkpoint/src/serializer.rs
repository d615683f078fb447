//! Checkpoint orchestrator.
//!
//! Drives one complete pass: types, then loaders, then members, then
//! strings, then tag clearing. The order is load-bearing — writing a type
//! tags its loader for the loader stage, member records need their owning
//! type registered first, and every stage interns names into the registry
//! as a side effect of writing its own records, which is why strings run
//! last.
//!
//! Exactly one pass executes at a time; the caller serializes invocations
//! externally. Traversal assumes a stable view of the host graph for the
//! duration of the pass.

use crate::artifacts::{ArtifactRegistry, BOOT_LOADER_NAME, BOOT_NAME_HASH};
use crate::emit::{
    both, effective_loader, guard, write_loader_record, write_member_record, write_text_record,
    write_type_record, CheckpointContext, Stream,
};
use crate::predicate::{
    AnyUsedPredicate, LeakPredicate, MemberPredicate, MembersPredicate, UniquePredicate,
    UsedPredicate,
};
use crate::writer::{ArtifactKind, CheckpointWriter};
use strobe_meta::{
    raw_text_hash, Epoch, LoaderId, LoaderMeta, MetadataGraph, Mode, TagBits, TypeId, TypeMeta,
    TypeName,
};

/// The checkpoint serialization engine.
///
/// Owns the artifact registry, the epoch phase, and the monotonic
/// checkpoint id. Created once per recorder and reused for every pass.
pub struct CheckpointSerializer {
    artifacts: ArtifactRegistry,
    epoch: Epoch,
    checkpoint_id: u64,
}

impl CheckpointSerializer {
    pub fn new() -> Self {
        CheckpointSerializer {
            artifacts: ArtifactRegistry::new(),
            epoch: Epoch::new(),
            checkpoint_id: 0,
        }
    }

    /// The epoch producers mark against.
    pub fn epoch(&self) -> &Epoch {
        &self.epoch
    }

    /// Advance the epoch. Called by the scheduler between passes, never
    /// during one.
    pub fn flip_epoch(&self) {
        self.epoch.flip();
    }

    /// Id of the most recent pass; 0 before the first.
    pub fn checkpoint_id(&self) -> u64 {
        self.checkpoint_id
    }

    /// Run one checkpoint pass.
    ///
    /// Emits all tagged constant artifacts and their dependencies into
    /// `out` (and the leak subset into `leak`, when given), then clears
    /// the consumed tag bits and the registry. An empty pass — nothing
    /// tagged since the last one — leaves both sinks and all tag state
    /// untouched.
    pub fn write<G: MetadataGraph>(
        &mut self,
        graph: &G,
        mode: Mode,
        out: &mut CheckpointWriter,
        mut leak: Option<&mut CheckpointWriter>,
    ) {
        self.checkpoint_id += 1;
        assert!(
            self.checkpoint_id >> 40 == 0,
            "checkpoint id space exhausted"
        );
        self.artifacts.reset(mode);
        let generation = mode.generation(&self.epoch);
        tracing::debug!(
            checkpoint = self.checkpoint_id,
            ?mode,
            leak = leak.is_some(),
            "begin checkpoint pass"
        );

        let mut cx = CheckpointContext {
            graph,
            artifacts: &mut self.artifacts,
            out,
            leak: leak.as_deref_mut(),
            mode,
            generation,
            checkpoint_id: self.checkpoint_id,
        };

        let types = write_types(&mut cx);
        if !cx.artifacts.has_type_entries() {
            tracing::debug!(checkpoint = self.checkpoint_id, "empty checkpoint pass");
            return;
        }
        let loaders = write_loaders(&mut cx);
        let members = write_members(&mut cx);
        let strings = write_strings(&mut cx);
        clear_artifacts(&mut cx);

        tracing::debug!(
            checkpoint = self.checkpoint_id,
            types,
            loaders,
            members,
            strings,
            "checkpoint pass complete"
        );
    }
}

impl Default for CheckpointSerializer {
    fn default() -> Self {
        Self::new()
    }
}

/// Stage 2: traverse the mode's type population and emit admitted types.
///
/// Composite pipeline per admitted type, leak side strictly before the
/// primary side (the primary write is what consumes transient state):
///
/// leak-loader tagging -> leak record [leak predicate]
///   -> primary record + loader used-tagging [used predicate]
///     -> registration
fn write_types<G: MetadataGraph>(cx: &mut CheckpointContext<'_, G>) -> usize {
    assert!(
        !cx.artifacts.has_type_entries(),
        "registry must be reset before the type stage"
    );
    let g = cx.generation;
    let mode = cx.mode;
    let graph = cx.graph;
    let has_leak = cx.has_leak();
    let used = UsedPredicate::new(g);
    let any_used = AnyUsedPredicate::new(g);
    let leak_pred = LeakPredicate::new(g);

    let out_block = cx.out.begin_block(ArtifactKind::Type);
    let leak_block = cx
        .leak
        .as_deref_mut()
        .map(|w| w.begin_block(ArtifactKind::Type));

    let tag_leak_loader = move |cx: &mut CheckpointContext<'_, G>, ty: &TypeMeta| {
        let cld = effective_loader(cx.graph, ty);
        if !cld.anonymous {
            cld.tags.set(TagBits::leak(g));
        }
        0
    };
    let emit_leak =
        |cx: &mut CheckpointContext<'_, G>, ty: &TypeMeta| write_type_record(cx, Stream::Leak, ty);
    let leak_side = guard(
        move |ty: &TypeMeta| has_leak && leak_pred.eval(&ty.tags),
        both(tag_leak_loader, emit_leak),
    );

    let emit_primary = |cx: &mut CheckpointContext<'_, G>, ty: &TypeMeta| {
        write_type_record(cx, Stream::Primary, ty)
    };
    let tag_used_loader = move |cx: &mut CheckpointContext<'_, G>, ty: &TypeMeta| {
        // Loaders reachable from written types feed the next stage.
        let cld = effective_loader(cx.graph, ty);
        if !cld.anonymous {
            cld.tags.set(TagBits::used(g));
        }
        0
    };
    let primary_side = guard(
        move |ty: &TypeMeta| used.eval(&ty.tags),
        both(emit_primary, tag_used_loader),
    );

    let register = |cx: &mut CheckpointContext<'_, G>, ty: &TypeMeta| {
        cx.artifacts.register_type(ty.id);
        0
    };

    let mut pipeline = both(both(leak_side, primary_side), register);

    let mut total = 0usize;
    graph.for_each_type(mode, &mut |ty| {
        let mut admitted = if has_leak {
            any_used.eval(&ty.tags)
        } else {
            used.eval(&ty.tags)
        };
        if !admitted && has_leak && (graph.is_loader_type(ty) || graph.is_root_type(ty)) {
            // Loader-describing types ride into the leak subset even when
            // not otherwise referenced, so the narrow stream can always
            // describe every loader.
            ty.tags.set(TagBits::leak(g));
            admitted = true;
        }
        if admitted {
            total += pipeline(cx, ty);
        }
    });

    cx.out.end_block(out_block);
    if let Some(token) = leak_block {
        cx.sink(Stream::Leak).end_block(token);
    }
    total
}

/// Stage 3: emit loaders discovered by stage 2.
///
/// Two discovery paths feed one pipeline: projection of the owning loader
/// over the registered types, then the host's loader traversal for
/// loaders tagged directly. Per loader, leak write before primary write
/// before clearing its generation bits — the clear is also what dedups
/// the leak stream on repeat visits, while the primary stream dedups via
/// the unique predicate.
fn write_loaders<G: MetadataGraph>(cx: &mut CheckpointContext<'_, G>) -> usize {
    assert!(
        cx.artifacts.has_type_entries(),
        "loader stage requires registered types"
    );
    let g = cx.generation;
    let mode = cx.mode;
    let graph = cx.graph;
    let has_leak = cx.has_leak();
    let any_used = AnyUsedPredicate::new(g);
    let leak_pred = LeakPredicate::new(g);
    let mut unique = UniquePredicate::<LoaderId>::new();

    let out_block = cx.out.begin_block(ArtifactKind::Loader);
    let leak_block = cx
        .leak
        .as_deref_mut()
        .map(|w| w.begin_block(ArtifactKind::Loader));

    let emit_leak = |cx: &mut CheckpointContext<'_, G>, cld: &LoaderMeta| {
        write_loader_record(cx, Stream::Leak, cld)
    };
    let leak_side = guard(
        move |cld: &LoaderMeta| has_leak && leak_pred.eval(&cld.tags),
        emit_leak,
    );
    let emit_primary = |cx: &mut CheckpointContext<'_, G>, cld: &LoaderMeta| {
        write_loader_record(cx, Stream::Primary, cld)
    };
    let primary_side = guard(
        move |cld: &LoaderMeta| unique.test_and_set(cld.id),
        emit_primary,
    );
    let clear_tags = move |_cx: &mut CheckpointContext<'_, G>, cld: &LoaderMeta| {
        // Loader marks are single-use within the checkpoint.
        cld.tags.clear(TagBits::generation(g));
        0
    };
    let mut pipeline = both(both(leak_side, primary_side), clear_tags);

    let mut total = 0usize;
    let type_ids: Vec<TypeId> = cx.artifacts.registered_types().to_vec();
    for id in type_ids {
        let ty = match graph.type_by_id(id) {
            Some(ty) => ty,
            None => panic!("registered type missing from graph"),
        };
        let cld = effective_loader(graph, ty);
        if !cld.anonymous {
            total += pipeline(cx, cld);
        }
    }
    graph.for_each_loader(mode, &mut |cld| {
        if cld.anonymous {
            return;
        }
        if any_used.eval(&cld.tags) {
            total += pipeline(cx, cld);
        }
    });

    cx.out.end_block(out_block);
    if let Some(token) = leak_block {
        cx.sink(Stream::Leak).end_block(token);
    }
    total
}

/// Stage 4: emit members of registered types whose member gate is set,
/// leak scan before the primary scan.
fn write_members<G: MetadataGraph>(cx: &mut CheckpointContext<'_, G>) -> usize {
    assert!(
        cx.artifacts.has_type_entries(),
        "member stage requires registered types"
    );
    let g = cx.generation;
    let graph = cx.graph;
    let has_leak = cx.has_leak();
    let members_used = MembersPredicate::used(g);
    let members_leak = MembersPredicate::leak(g);
    let eligible = MemberPredicate::new(cx.mode, g);

    let out_block = cx.out.begin_block(ArtifactKind::Member);
    let leak_block = cx
        .leak
        .as_deref_mut()
        .map(|w| w.begin_block(ArtifactKind::Member));

    let mut total = 0usize;
    let type_ids: Vec<TypeId> = cx.artifacts.registered_types().to_vec();
    for id in type_ids {
        let ty = match graph.type_by_id(id) {
            Some(ty) => ty,
            None => panic!("registered type missing from graph"),
        };
        if has_leak && members_leak.eval(&ty.tags) {
            for member in graph.members_of(id) {
                if eligible.eval(member) {
                    total += write_member_record(cx, Stream::Leak, ty, member);
                }
            }
        }
        if members_used.eval(&ty.tags) {
            for member in graph.members_of(id) {
                if eligible.eval(member) {
                    total += write_member_record(cx, Stream::Primary, ty, member);
                }
            }
        }
    }

    cx.out.end_block(out_block);
    if let Some(token) = leak_block {
        cx.sink(Stream::Leak).end_block(token);
    }
    total
}

/// Stage 5: emit every string accumulated by the earlier stages — the
/// leak subset's own symbol block first, then the primary merged block
/// (canonical entries, then raw text), one record per distinct string.
fn write_strings<G: MetadataGraph>(cx: &mut CheckpointContext<'_, G>) -> usize {
    assert!(
        cx.artifacts.has_type_entries(),
        "string stage requires registered types"
    );
    let mut total = 0usize;
    if cx.has_leak() {
        total += write_leak_strings(cx);
    }

    let checkpoint_id = cx.checkpoint_id;
    let symbols = cx.graph.symbols();
    let artifacts = &*cx.artifacts;
    let out = &mut *cx.out;

    let block = out.begin_block(ArtifactKind::Symbol);
    for (ordinal, sym) in artifacts.iter_symbols() {
        total += write_text_record(out, checkpoint_id, ordinal, symbols.lookup(sym));
    }
    for (ordinal, text) in artifacts.iter_raw() {
        total += write_text_record(out, checkpoint_id, ordinal, text);
    }
    out.end_block(block);
    total
}

/// Leak-subset strings: for each registered type in the leak subset, its
/// name, its loader's name, and — when its member gate is set — eligible
/// members' names and signatures, each at most once.
fn write_leak_strings<G: MetadataGraph>(cx: &mut CheckpointContext<'_, G>) -> usize {
    let g = cx.generation;
    let leak_pred = LeakPredicate::new(g);
    let members_leak = MembersPredicate::leak(g);
    let eligible = MemberPredicate::new(cx.mode, g);
    let mut unique = UniquePredicate::<u32>::new();
    let graph = cx.graph;
    let checkpoint_id = cx.checkpoint_id;
    let symbols = graph.symbols();

    let artifacts = &*cx.artifacts;
    let leak = match cx.leak.as_deref_mut() {
        Some(w) => w,
        None => panic!("leak stream not requested for this pass"),
    };

    let block = leak.begin_block(ArtifactKind::Symbol);
    let mut total = 0usize;
    for &id in artifacts.registered_types() {
        let ty = match graph.type_by_id(id) {
            Some(ty) => ty,
            None => panic!("registered type missing from graph"),
        };
        if !leak_pred.eval(&ty.tags) {
            continue;
        }

        let ordinal = match artifacts.type_name_ordinal(ty) {
            Some(ordinal) => ordinal,
            None => panic!("type name not interned"),
        };
        let text: &str = match &ty.name {
            TypeName::Symbol(sym) => symbols.lookup(*sym),
            TypeName::Raw { text, .. } => text.as_str(),
        };
        if unique.test_and_set(ordinal) {
            total += write_text_record(leak, checkpoint_id, ordinal, text);
        }

        let cld = effective_loader(graph, ty);
        if !cld.anonymous {
            match cld.defining_type {
                None => {
                    let ordinal = match artifacts.raw_ordinal(BOOT_NAME_HASH) {
                        Some(ordinal) => ordinal,
                        None => panic!("bootstrap name missing from registry"),
                    };
                    if unique.test_and_set(ordinal) {
                        total += write_text_record(leak, checkpoint_id, ordinal, BOOT_LOADER_NAME);
                    }
                }
                Some(_) => {
                    if let Some(name) = cld.name.as_deref().filter(|n| !n.is_empty()) {
                        if let Some(ordinal) = artifacts.raw_ordinal(raw_text_hash(name)) {
                            if unique.test_and_set(ordinal) {
                                total += write_text_record(leak, checkpoint_id, ordinal, name);
                            }
                        }
                    }
                }
            }
        }

        if members_leak.eval(&ty.tags) {
            for member in graph.members_of(id) {
                if !eligible.eval(member) {
                    continue;
                }
                for sym in [member.name, member.signature] {
                    let ordinal = match artifacts.symbol_ordinal(sym) {
                        Some(ordinal) => ordinal,
                        None => panic!("member symbol not interned"),
                    };
                    if unique.test_and_set(ordinal) {
                        total += write_text_record(leak, checkpoint_id, ordinal, symbols.lookup(sym));
                    }
                }
            }
        }
    }
    leak.end_block(block);
    total
}

/// Stage 6: untag everything the pass consumed and wipe the registry.
/// Only the pass generation's bits are cleared — marks made during the
/// pass live in the other generation and surface next time.
fn clear_artifacts<G: MetadataGraph>(cx: &mut CheckpointContext<'_, G>) {
    assert!(
        cx.artifacts.has_type_entries(),
        "clearing requires a productive pass"
    );
    let g = cx.generation;
    let members_any = MembersPredicate::any(g);
    let graph = cx.graph;
    for &id in cx.artifacts.registered_types() {
        let ty = match graph.type_by_id(id) {
            Some(ty) => ty,
            None => panic!("registered type missing from graph"),
        };
        if members_any.eval(&ty.tags) {
            for member in graph.members_of(id) {
                member.tags.clear(TagBits::used(g));
            }
        }
        ty.tags.clear(TagBits::generation(g));
    }
    cx.artifacts.clear();
}
