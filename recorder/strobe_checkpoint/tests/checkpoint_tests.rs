//! End-to-end checkpoint passes over a fabricated host graph.

use pretty_assertions::assert_eq;
use rustc_hash::FxHashMap;
use strobe_checkpoint::{ArtifactKind, CheckpointSerializer, CheckpointWriter};
use strobe_meta::{
    LoaderId, LoaderMeta, MemberFlags, MemberId, MemberMeta, MetadataGraph, Mode, SymbolStore,
    TypeId, TypeKind, TypeMeta, TypeName,
};

// --- fixture graph ---

struct TestGraph {
    symbols: SymbolStore,
    types: Vec<TypeMeta>,
    loaders: Vec<LoaderMeta>,
    members: FxHashMap<TypeId, Vec<MemberMeta>>,
    /// Types enumerated by a retirement pass.
    retiring: Vec<TypeId>,
    /// Types that describe loaders (for leak-subset completeness).
    loader_types: Vec<TypeId>,
    root_type: Option<TypeId>,
}

impl TestGraph {
    fn new() -> Self {
        TestGraph {
            symbols: SymbolStore::new(),
            types: Vec::new(),
            loaders: Vec::new(),
            members: FxHashMap::default(),
            retiring: Vec::new(),
            loader_types: Vec::new(),
            root_type: None,
        }
    }

    fn add_loader(&mut self, id: u64, defining_type: Option<TypeId>) -> LoaderId {
        self.loaders.push(LoaderMeta::new(LoaderId(id), defining_type));
        LoaderId(id)
    }

    fn add_type(&mut self, id: u64, loader: LoaderId, name: &str) -> TypeId {
        let sym = self.symbols.intern(name);
        self.types.push(TypeMeta::new(
            TypeId(id),
            loader,
            TypeName::Symbol(sym),
            0,
            TypeKind::Instance,
        ));
        TypeId(id)
    }

    fn add_array_type(&mut self, id: u64, loader: LoaderId, name: &str, element: TypeId) -> TypeId {
        let sym = self.symbols.intern(name);
        self.types.push(TypeMeta::new(
            TypeId(id),
            loader,
            TypeName::Symbol(sym),
            0,
            TypeKind::Array { element },
        ));
        TypeId(id)
    }

    fn add_member(&mut self, ty: TypeId, slot: u32, name: &str, sig: &str) {
        let name = self.symbols.intern(name);
        let sig = self.symbols.intern(sig);
        self.members
            .entry(ty)
            .or_default()
            .push(MemberMeta::new(MemberId(slot), name, sig, MemberFlags::empty()));
    }

    fn ty(&self, id: TypeId) -> &TypeMeta {
        self.type_by_id(id).unwrap()
    }

    fn member(&self, ty: TypeId, slot: usize) -> &MemberMeta {
        &self.members[&ty][slot]
    }
}

impl MetadataGraph for TestGraph {
    fn for_each_type(&self, mode: Mode, visit: &mut dyn FnMut(&TypeMeta)) {
        match mode {
            Mode::SteadyState => {
                for ty in &self.types {
                    visit(ty);
                }
            }
            Mode::Retirement => {
                for id in &self.retiring {
                    visit(self.ty(*id));
                }
            }
        }
    }

    fn for_each_loader(&self, mode: Mode, visit: &mut dyn FnMut(&LoaderMeta)) {
        match mode {
            Mode::SteadyState => {
                for cld in &self.loaders {
                    visit(cld);
                }
            }
            Mode::Retirement => {}
        }
    }

    fn type_by_id(&self, id: TypeId) -> Option<&TypeMeta> {
        self.types.iter().find(|ty| ty.id == id)
    }

    fn loader_by_id(&self, id: LoaderId) -> Option<&LoaderMeta> {
        self.loaders.iter().find(|cld| cld.id == id)
    }

    fn members_of(&self, id: TypeId) -> &[MemberMeta] {
        self.members.get(&id).map_or(&[], Vec::as_slice)
    }

    fn is_loader_type(&self, ty: &TypeMeta) -> bool {
        self.loader_types.contains(&ty.id)
    }

    fn is_root_type(&self, ty: &TypeMeta) -> bool {
        self.root_type == Some(ty.id)
    }

    fn symbols(&self) -> &SymbolStore {
        &self.symbols
    }
}

// --- stream decoding ---

#[derive(Debug, Clone, PartialEq)]
enum Record {
    Type {
        id: u64,
        loader: u64,
        name_ref: u64,
    },
    Member {
        key: u64,
        owner: u64,
        name_ref: u64,
        sig_ref: u64,
        hidden: u8,
    },
    Loader {
        id: u64,
        defining: u64,
        name_ref: u64,
    },
    Text {
        aref: u64,
        text: String,
    },
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> u8 {
        let v = self.buf[self.pos];
        self.pos += 1;
        v
    }

    fn u16(&mut self) -> u16 {
        let v = u16::from_le_bytes(self.buf[self.pos..self.pos + 2].try_into().unwrap());
        self.pos += 2;
        v
    }

    fn u32(&mut self) -> u32 {
        let v = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        v
    }

    fn u64(&mut self) -> u64 {
        let v = u64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        v
    }

    fn str(&mut self) -> String {
        let len = self.u32() as usize;
        let s = std::str::from_utf8(&self.buf[self.pos..self.pos + len]).unwrap();
        self.pos += len;
        s.to_owned()
    }
}

fn decode(buf: &[u8]) -> Vec<(u8, Vec<Record>)> {
    let mut cursor = Cursor { buf, pos: 0 };
    let mut blocks = Vec::new();
    while cursor.pos < buf.len() {
        let kind = cursor.u8();
        let count = cursor.u32();
        let mut records = Vec::new();
        for _ in 0..count {
            let record = if kind == ArtifactKind::Type as u8 {
                let id = cursor.u64();
                let loader = cursor.u64();
                let name_ref = cursor.u64();
                let _flags = cursor.u32();
                Record::Type { id, loader, name_ref }
            } else if kind == ArtifactKind::Member as u8 {
                let key = cursor.u64();
                let owner = cursor.u64();
                let name_ref = cursor.u64();
                let sig_ref = cursor.u64();
                let _flags = cursor.u16();
                let hidden = cursor.u8();
                Record::Member { key, owner, name_ref, sig_ref, hidden }
            } else if kind == ArtifactKind::Loader as u8 {
                let id = cursor.u64();
                let defining = cursor.u64();
                let name_ref = cursor.u64();
                Record::Loader { id, defining, name_ref }
            } else if kind == ArtifactKind::Symbol as u8 {
                let aref = cursor.u64();
                let text = cursor.str();
                Record::Text { aref, text }
            } else {
                panic!("unknown record kind {kind}");
            };
            records.push(record);
        }
        blocks.push((kind, records));
    }
    blocks
}

fn records_of(blocks: &[(u8, Vec<Record>)], kind: ArtifactKind) -> Vec<Record> {
    blocks
        .iter()
        .filter(|(k, _)| *k == kind as u8)
        .flat_map(|(_, records)| records.iter().cloned())
        .collect()
}

fn texts(blocks: &[(u8, Vec<Record>)]) -> Vec<(u64, String)> {
    records_of(blocks, ArtifactKind::Symbol)
        .into_iter()
        .map(|r| match r {
            Record::Text { aref, text } => (aref, text),
            other => panic!("expected text record, got {other:?}"),
        })
        .collect()
}

/// Bootstrap-loaded type A with one member m()V — the canonical scenario.
fn boot_graph() -> (TestGraph, TypeId) {
    let mut graph = TestGraph::new();
    let boot = graph.add_loader(0, None);
    let a = graph.add_type(10, boot, "A");
    graph.add_member(a, 0, "m", "()V");
    (graph, a)
}

// --- tests ---

#[test]
fn test_steady_state_scenario() {
    let (graph, a) = boot_graph();
    let mut serializer = CheckpointSerializer::new();

    graph.ty(a).tag_member_used(graph.member(a, 0), serializer.epoch());
    serializer.flip_epoch();

    let mut out = CheckpointWriter::new();
    serializer.write(&graph, Mode::SteadyState, &mut out, None);

    let blocks = decode(out.bytes());
    let types = records_of(&blocks, ArtifactKind::Type);
    let loaders = records_of(&blocks, ArtifactKind::Loader);
    let members = records_of(&blocks, ArtifactKind::Member);
    let strings = texts(&blocks);

    // One type record for A, owning-loader id 0 (bootstrap).
    assert_eq!(types.len(), 1);
    let Record::Type { id, loader, name_ref } = types[0] else {
        panic!("expected type record");
    };
    assert_eq!(id, 10);
    assert_eq!(loader, 0);

    // One loader record for the bootstrap loader, canned name.
    assert_eq!(loaders.len(), 1);
    let Record::Loader { id, defining, name_ref: loader_name } = loaders[0] else {
        panic!("expected loader record");
    };
    assert_eq!(id, 0);
    assert_eq!(defining, 0);

    // One member record for m.
    assert_eq!(members.len(), 1);
    let Record::Member { key, owner, name_ref: m_name, sig_ref, hidden } = members[0] else {
        panic!("expected member record");
    };
    assert_eq!(owner, 10);
    assert_eq!(key, (10 << 16) | 1);
    assert_eq!(hidden, 0);

    // "A", "m", "()V" plus the canned "boot" — no duplicates.
    let mut names: Vec<&str> = strings.iter().map(|(_, t)| t.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["()V", "A", "boot", "m"]);

    // Every reference resolves within the checkpoint.
    for aref in [name_ref, loader_name, m_name, sig_ref] {
        assert!(strings.iter().any(|(r, _)| *r == aref), "unresolved ref {aref}");
    }
}

#[test]
fn test_untagged_graph_is_empty_checkpoint() {
    let (graph, _) = boot_graph();
    let mut serializer = CheckpointSerializer::new();
    serializer.flip_epoch();

    let mut out = CheckpointWriter::new();
    serializer.write(&graph, Mode::SteadyState, &mut out, None);
    assert!(out.is_empty());
}

#[test]
fn test_clearing_makes_next_pass_empty() {
    let (graph, a) = boot_graph();
    let mut serializer = CheckpointSerializer::new();

    graph.ty(a).tag_member_used(graph.member(a, 0), serializer.epoch());
    serializer.flip_epoch();

    let mut out = CheckpointWriter::new();
    serializer.write(&graph, Mode::SteadyState, &mut out, None);
    assert!(!out.is_empty());

    // Nothing newly tagged: the same pass again must produce nothing.
    let mut again = CheckpointWriter::new();
    serializer.write(&graph, Mode::SteadyState, &mut again, None);
    assert!(again.is_empty());
}

#[test]
fn test_epoch_isolation() {
    let mut graph = TestGraph::new();
    let boot = graph.add_loader(0, None);
    let a = graph.add_type(1, boot, "A");
    let b = graph.add_type(2, boot, "B");
    let mut serializer = CheckpointSerializer::new();

    graph.ty(a).tag_used(serializer.epoch());
    serializer.flip_epoch();
    // B is marked while the pass for A is conceptually in flight: it lands
    // in the new current generation and must not surface yet.
    graph.ty(b).tag_used(serializer.epoch());

    let mut first = CheckpointWriter::new();
    serializer.write(&graph, Mode::SteadyState, &mut first, None);
    let first_types = records_of(&decode(first.bytes()), ArtifactKind::Type);
    assert_eq!(first_types.len(), 1);
    assert!(matches!(first_types[0], Record::Type { id: 1, .. }));

    serializer.flip_epoch();
    let mut second = CheckpointWriter::new();
    serializer.write(&graph, Mode::SteadyState, &mut second, None);
    let second_types = records_of(&decode(second.bytes()), ArtifactKind::Type);
    assert_eq!(second_types.len(), 1);
    assert!(matches!(second_types[0], Record::Type { id: 2, .. }));
}

#[test]
fn test_deterministic_output() {
    let build = || {
        let (graph, a) = boot_graph();
        let mut serializer = CheckpointSerializer::new();
        graph.ty(a).tag_member_used(graph.member(a, 0), serializer.epoch());
        serializer.flip_epoch();
        let mut out = CheckpointWriter::new();
        serializer.write(&graph, Mode::SteadyState, &mut out, None);
        out.into_bytes()
    };
    assert_eq!(build(), build());
}

#[test]
fn test_shared_loader_written_once() {
    let mut graph = TestGraph::new();
    let boot = graph.add_loader(0, None);
    let a = graph.add_type(1, boot, "A");
    let b = graph.add_type(2, boot, "B");
    let mut serializer = CheckpointSerializer::new();

    graph.ty(a).tag_used(serializer.epoch());
    graph.ty(b).tag_used(serializer.epoch());
    serializer.flip_epoch();

    let mut out = CheckpointWriter::new();
    serializer.write(&graph, Mode::SteadyState, &mut out, None);

    let blocks = decode(out.bytes());
    assert_eq!(records_of(&blocks, ArtifactKind::Type).len(), 2);
    assert_eq!(records_of(&blocks, ArtifactKind::Loader).len(), 1);
}

#[test]
fn test_no_duplicate_refs_per_kind() {
    let mut graph = TestGraph::new();
    let boot = graph.add_loader(0, None);
    // Type named like its own member: one string entry, referenced twice.
    let a = graph.add_type(1, boot, "run");
    graph.add_member(a, 0, "run", "()V");
    let mut serializer = CheckpointSerializer::new();

    graph.ty(a).tag_member_used(graph.member(a, 0), serializer.epoch());
    serializer.flip_epoch();

    let mut out = CheckpointWriter::new();
    serializer.write(&graph, Mode::SteadyState, &mut out, None);

    let blocks = decode(out.bytes());
    let strings = texts(&blocks);
    let mut refs: Vec<u64> = strings.iter().map(|(r, _)| *r).collect();
    refs.sort_unstable();
    let before = refs.len();
    refs.dedup();
    assert_eq!(refs.len(), before, "duplicate text reference");
    assert_eq!(strings.iter().filter(|(_, t)| t == "run").count(), 1);

    // Type and member reference the same entry.
    let type_records = records_of(&blocks, ArtifactKind::Type);
    let member_records = records_of(&blocks, ArtifactKind::Member);
    let Record::Type { name_ref, .. } = type_records[0] else {
        panic!("expected type record");
    };
    let Record::Member { name_ref: member_name, .. } = member_records[0] else {
        panic!("expected member record");
    };
    assert_eq!(name_ref, member_name);
}

#[test]
fn test_array_type_resolves_element_loader() {
    let mut graph = TestGraph::new();
    graph.add_loader(0, None);
    let app_type = graph.add_type(5, LoaderId(0), "AppLoader");
    let app = graph.add_loader(7, Some(app_type));
    let elem = graph.add_type(1, app, "Elem");
    // The array itself claims the bootstrap loader; attribution must
    // follow the element type.
    let arr = graph.add_array_type(2, LoaderId(0), "Elem[]", elem);
    let mut serializer = CheckpointSerializer::new();

    graph.ty(arr).tag_used(serializer.epoch());
    serializer.flip_epoch();

    let mut out = CheckpointWriter::new();
    serializer.write(&graph, Mode::SteadyState, &mut out, None);

    let blocks = decode(out.bytes());
    let types = records_of(&blocks, ArtifactKind::Type);
    assert_eq!(types.len(), 1);
    let Record::Type { loader, .. } = types[0] else {
        panic!("expected type record");
    };
    assert_eq!(loader, 7);

    // The element's loader was tagged and emitted.
    let loaders = records_of(&blocks, ArtifactKind::Loader);
    assert_eq!(loaders.len(), 1);
    assert!(matches!(loaders[0], Record::Loader { id: 7, defining: 5, .. }));
}

#[test]
fn test_anonymous_loader_collapses() {
    let mut graph = TestGraph::new();
    graph.add_loader(0, None);
    let host_type = graph.add_type(3, LoaderId(0), "Host");
    let anon = graph.add_loader(9, Some(host_type));
    graph.loaders.last_mut().unwrap().anonymous = true;
    let a = graph.add_type(1, anon, "A");
    let mut serializer = CheckpointSerializer::new();

    graph.ty(a).tag_used(serializer.epoch());
    serializer.flip_epoch();

    let mut out = CheckpointWriter::new();
    serializer.write(&graph, Mode::SteadyState, &mut out, None);

    let blocks = decode(out.bytes());
    let types = records_of(&blocks, ArtifactKind::Type);
    let Record::Type { loader, .. } = types[0] else {
        panic!("expected type record");
    };
    assert_eq!(loader, 0, "anonymous loader writes as absent");
    assert!(records_of(&blocks, ArtifactKind::Loader).is_empty());
}

#[test]
fn test_synthetic_members_filtered_in_steady_state() {
    let mut graph = TestGraph::new();
    let boot = graph.add_loader(0, None);
    let a = graph.add_type(1, boot, "A");
    graph.add_member(a, 0, "real", "()V");
    graph.add_member(a, 1, "bridge", "()V");
    graph.members.get_mut(&a).unwrap()[1].flags = MemberFlags::SYNTHETIC;
    let mut serializer = CheckpointSerializer::new();

    graph.ty(a).tag_member_used(graph.member(a, 0), serializer.epoch());
    graph.ty(a).tag_member_used(graph.member(a, 1), serializer.epoch());
    serializer.flip_epoch();

    let mut out = CheckpointWriter::new();
    serializer.write(&graph, Mode::SteadyState, &mut out, None);

    let members = records_of(&decode(out.bytes()), ArtifactKind::Member);
    assert_eq!(members.len(), 1);
    assert!(matches!(members[0], Record::Member { key, .. } if key == (1 << 16) | 1));
}

#[test]
fn test_retirement_includes_synthetic_members() {
    let mut graph = TestGraph::new();
    let boot = graph.add_loader(0, None);
    let a = graph.add_type(1, boot, "A");
    graph.add_member(a, 0, "bridge", "()V");
    graph.members.get_mut(&a).unwrap()[0].flags = MemberFlags::SYNTHETIC;
    graph.retiring.push(a);
    let mut serializer = CheckpointSerializer::new();

    // Retirement consumes the current generation: no flip.
    graph.ty(a).tag_member_used(graph.member(a, 0), serializer.epoch());

    let mut out = CheckpointWriter::new();
    serializer.write(&graph, Mode::Retirement, &mut out, None);

    let members = records_of(&decode(out.bytes()), ArtifactKind::Member);
    assert_eq!(members.len(), 1);
}

#[test]
fn test_retirement_leak_subset_only() {
    let mut graph = TestGraph::new();
    graph.add_loader(0, None);
    // A loader-describing type that nothing referenced.
    let l = graph.add_type(4, LoaderId(0), "Loader");
    graph.loader_types.push(l);
    graph.retiring.push(l);
    let mut serializer = CheckpointSerializer::new();

    let mut out = CheckpointWriter::new();
    let mut leak = CheckpointWriter::new();
    serializer.write(&graph, Mode::Retirement, &mut out, Some(&mut leak));

    let leak_types = records_of(&decode(leak.bytes()), ArtifactKind::Type);
    assert_eq!(leak_types.len(), 1);
    assert!(matches!(leak_types[0], Record::Type { id: 4, .. }));

    // Not in the primary type stream.
    let out_types = records_of(&decode(out.bytes()), ArtifactKind::Type);
    assert!(out_types.is_empty());

    // The leak stream can resolve the type's name on its own.
    let Record::Type { name_ref, .. } = leak_types[0] else {
        panic!("expected type record");
    };
    assert!(texts(&decode(leak.bytes())).iter().any(|(r, _)| *r == name_ref));
}

#[test]
fn test_leak_and_primary_share_ordinals() {
    let (graph, a) = boot_graph();
    let mut serializer = CheckpointSerializer::new();

    graph.ty(a).tag_used(serializer.epoch());
    graph.ty(a).tag_leak(serializer.epoch());
    serializer.flip_epoch();

    let mut out = CheckpointWriter::new();
    let mut leak = CheckpointWriter::new();
    serializer.write(&graph, Mode::SteadyState, &mut out, Some(&mut leak));

    let out_types = records_of(&decode(out.bytes()), ArtifactKind::Type);
    let leak_types = records_of(&decode(leak.bytes()), ArtifactKind::Type);
    assert_eq!(out_types.len(), 1);
    assert_eq!(leak_types.len(), 1);
    // Same artifact, same reference, both streams.
    assert_eq!(out_types[0], leak_types[0]);

    // Each stream resolves the name itself, once.
    assert_eq!(
        texts(&decode(leak.bytes())).iter().filter(|(_, t)| t == "A").count(),
        1
    );
    assert_eq!(
        texts(&decode(out.bytes())).iter().filter(|(_, t)| t == "A").count(),
        1
    );
}

#[test]
fn test_closure_completeness() {
    let mut graph = TestGraph::new();
    graph.add_loader(0, None);
    let app_type = graph.add_type(5, LoaderId(0), "AppLoader");
    let app = graph.add_loader(7, Some(app_type));
    let a = graph.add_type(1, app, "A");
    let b = graph.add_type(2, app, "B");
    graph.add_member(a, 0, "m", "()V");
    graph.add_member(b, 0, "n", "(I)Z");
    let mut serializer = CheckpointSerializer::new();

    graph.ty(a).tag_member_used(graph.member(a, 0), serializer.epoch());
    graph.ty(b).tag_member_used(graph.member(b, 0), serializer.epoch());
    graph.ty(app_type).tag_used(serializer.epoch());
    serializer.flip_epoch();

    let mut out = CheckpointWriter::new();
    serializer.write(&graph, Mode::SteadyState, &mut out, None);

    let blocks = decode(out.bytes());
    let strings = texts(&blocks);
    let type_records = records_of(&blocks, ArtifactKind::Type);
    let loader_ids: Vec<u64> = records_of(&blocks, ArtifactKind::Loader)
        .iter()
        .map(|r| match r {
            Record::Loader { id, .. } => *id,
            other => panic!("expected loader record, got {other:?}"),
        })
        .collect();
    let type_ids: Vec<u64> = type_records
        .iter()
        .map(|r| match r {
            Record::Type { id, .. } => *id,
            other => panic!("expected type record, got {other:?}"),
        })
        .collect();

    for record in &type_records {
        let Record::Type { loader, name_ref, .. } = record else {
            panic!("expected type record");
        };
        if *loader != 0 {
            assert!(loader_ids.contains(loader), "loader {loader} unresolved");
        }
        assert!(strings.iter().any(|(r, _)| r == name_ref));
    }
    for record in records_of(&blocks, ArtifactKind::Member) {
        let Record::Member { owner, name_ref, sig_ref, .. } = record else {
            panic!("expected member record");
        };
        assert!(type_ids.contains(&owner), "owner {owner} unresolved");
        assert!(strings.iter().any(|(r, _)| *r == name_ref));
        assert!(strings.iter().any(|(r, _)| *r == sig_ref));
    }
}

#[test]
fn test_checkpoint_ids_advance() {
    let (graph, a) = boot_graph();
    let mut serializer = CheckpointSerializer::new();

    graph.ty(a).tag_used(serializer.epoch());
    serializer.flip_epoch();
    let mut first = CheckpointWriter::new();
    serializer.write(&graph, Mode::SteadyState, &mut first, None);
    assert_eq!(serializer.checkpoint_id(), 1);

    graph.ty(a).tag_used(serializer.epoch());
    serializer.flip_epoch();
    let mut second = CheckpointWriter::new();
    serializer.write(&graph, Mode::SteadyState, &mut second, None);
    assert_eq!(serializer.checkpoint_id(), 2);

    let first_ref = match records_of(&decode(first.bytes()), ArtifactKind::Type)[0] {
        Record::Type { name_ref, .. } => name_ref,
        ref other => panic!("expected type record, got {other:?}"),
    };
    let second_ref = match records_of(&decode(second.bytes()), ArtifactKind::Type)[0] {
        Record::Type { name_ref, .. } => name_ref,
        ref other => panic!("expected type record, got {other:?}"),
    };
    // Same ordinal, different checkpoint: globally distinct references.
    assert_ne!(first_ref, second_ref);
    assert_eq!(first_ref & 0xFF_FFFF, second_ref & 0xFF_FFFF);
}
