//! Per-kind record writers and the combinators that compose them.
//!
//! A writer is a function `(&mut CheckpointContext, &object) -> usize`
//! returning the number of records it emitted. Writers chain with
//! [`both`] (apply both, sum the counts) and [`guard`] (apply only when a
//! predicate holds), which is how each stage builds its pipeline without
//! virtual dispatch.
//!
//! Emitting a record can register further artifacts as a side effect
//! (a type write interns its name; a loader write may intern a display
//! name), which is what feeds later stages of the same pass.

use crate::artifacts::{ArtifactRegistry, BOOT_NAME_HASH};
use crate::writer::CheckpointWriter;
use strobe_meta::{
    raw_text_hash, ArtifactRef, EpochId, LoaderMeta, MemberMeta, MetadataGraph, Mode, TypeId,
    TypeKind, TypeMeta,
};

/// Which output stream a writer targets.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Stream {
    Primary,
    Leak,
}

/// Pass state threaded by reference through every writer and stage.
pub struct CheckpointContext<'a, G: MetadataGraph> {
    pub graph: &'a G,
    pub artifacts: &'a mut ArtifactRegistry,
    pub out: &'a mut CheckpointWriter,
    pub leak: Option<&'a mut CheckpointWriter>,
    pub mode: Mode,
    /// Tag-bit generation this pass consumes (derived from the mode once,
    /// at pass start).
    pub generation: EpochId,
    pub checkpoint_id: u64,
}

impl<G: MetadataGraph> CheckpointContext<'_, G> {
    /// Full reference for a registry ordinal under this pass's id.
    #[inline]
    pub fn artifact_ref(&self, ordinal: u32) -> ArtifactRef {
        ArtifactRef::compose(self.checkpoint_id, ordinal)
    }

    pub fn has_leak(&self) -> bool {
        self.leak.is_some()
    }

    /// The sink for a stream. The leak sink must have been requested.
    pub fn sink(&mut self, stream: Stream) -> &mut CheckpointWriter {
        match stream {
            Stream::Primary => &mut *self.out,
            Stream::Leak => match self.leak.as_deref_mut() {
                Some(w) => w,
                None => panic!("leak stream not requested for this pass"),
            },
        }
    }
}

/// Apply `f` then `g` to the same object; counts sum.
pub fn both<C, T: ?Sized, F, G>(mut f: F, mut g: G) -> impl FnMut(&mut C, &T) -> usize
where
    F: FnMut(&mut C, &T) -> usize,
    G: FnMut(&mut C, &T) -> usize,
{
    move |cx, item| f(cx, item) + g(cx, item)
}

/// Apply `f` only when `p` holds; otherwise a no-op.
pub fn guard<C, T: ?Sized, P, F>(mut p: P, mut f: F) -> impl FnMut(&mut C, &T) -> usize
where
    P: FnMut(&T) -> bool,
    F: FnMut(&mut C, &T) -> usize,
{
    move |cx, item| if p(item) { f(cx, item) } else { 0 }
}

/// The loader a type is attributed to. Array types have no loader of
/// their own and resolve through their element type.
pub(crate) fn effective_loader<'g, G: MetadataGraph>(
    graph: &'g G,
    ty: &TypeMeta,
) -> &'g LoaderMeta {
    let loader_id = match ty.kind {
        TypeKind::Array { element } => match graph.type_by_id(element) {
            Some(elem) => elem.loader,
            None => panic!("array element type missing from graph"),
        },
        TypeKind::Instance | TypeKind::Primitive => ty.loader,
    };
    match graph.loader_by_id(loader_id) {
        Some(cld) => cld,
        None => panic!("loader missing from graph"),
    }
}

/// Loader id as written into type records: anonymous loaders collapse
/// into their defining type and write as 0.
#[inline]
pub(crate) fn loader_record_id(cld: &LoaderMeta) -> u64 {
    if cld.anonymous {
        0
    } else {
        cld.id.0
    }
}

/// Combined (type, member) identity key. Hosts keep type ids under 2^48;
/// member slots fit in 16 bits.
#[inline]
pub fn member_key(ty: TypeId, member: &MemberMeta) -> u64 {
    debug_assert!(member.id.0 < 0xFFFF);
    (ty.0 << 16) | u64::from(member.id.0 + 1)
}

/// Type record: identity id, owning-loader id, name ref, flag bits.
///
/// Interning the name is the side effect that makes the string show up in
/// the strings stage.
pub fn write_type_record<G: MetadataGraph>(
    cx: &mut CheckpointContext<'_, G>,
    stream: Stream,
    ty: &TypeMeta,
) -> usize {
    let ordinal = cx.artifacts.mark_type(ty);
    assert!(ordinal > 0, "type name must intern to a positive ordinal");
    let name_ref = cx.artifact_ref(ordinal);
    let loader_id = loader_record_id(effective_loader(cx.graph, ty));

    let w = cx.sink(stream);
    w.write_u64(ty.id.0);
    w.write_u64(loader_id);
    w.write_u64(name_ref.raw());
    w.write_u32(ty.flags);
    w.note_record();
    1
}

/// Member record: combined key, owning type id, name ref, signature ref,
/// flag bits, hidden marker.
pub fn write_member_record<G: MetadataGraph>(
    cx: &mut CheckpointContext<'_, G>,
    stream: Stream,
    ty: &TypeMeta,
    member: &MemberMeta,
) -> usize {
    let name_ordinal = cx.artifacts.mark_symbol(member.name);
    let sig_ordinal = cx.artifacts.mark_symbol(member.signature);
    let name_ref = cx.artifact_ref(name_ordinal);
    let sig_ref = cx.artifact_ref(sig_ordinal);

    let w = cx.sink(stream);
    w.write_u64(member_key(ty.id, member));
    w.write_u64(ty.id.0);
    w.write_u64(name_ref.raw());
    w.write_u64(sig_ref.raw());
    w.write_u16(member.flags.bits());
    w.write_u8(u8::from(member.hidden));
    w.note_record();
    1
}

/// Display-name ordinal for a non-bootstrap loader, interning the text.
///
/// Hosts do not currently publish loader names, so this resolves to
/// `None` in practice; the path stays live end to end.
fn loader_name_ordinal<G: MetadataGraph>(
    cx: &mut CheckpointContext<'_, G>,
    cld: &LoaderMeta,
) -> Option<u32> {
    let name = cld.name.as_deref()?;
    if name.is_empty() {
        return None;
    }
    Some(cx.artifacts.mark_raw(name, raw_text_hash(name)))
}

/// Loader record: identity id, defining-type id (0 = bootstrap),
/// display-name ref (0 = none).
pub fn write_loader_record<G: MetadataGraph>(
    cx: &mut CheckpointContext<'_, G>,
    stream: Stream,
    cld: &LoaderMeta,
) -> usize {
    assert!(
        !cld.anonymous,
        "anonymous loaders collapse into their defining type"
    );
    match cld.defining_type {
        None => {
            // Bootstrap loader: canned name, pre-interned at reset.
            let boot = match cx.artifacts.raw_ordinal(BOOT_NAME_HASH) {
                Some(ordinal) => ordinal,
                None => panic!("bootstrap name missing from registry"),
            };
            let name_ref = cx.artifact_ref(boot);
            let w = cx.sink(stream);
            w.write_u64(cld.id.0);
            w.write_u64(0);
            w.write_u64(name_ref.raw());
            w.note_record();
        }
        Some(defining) => {
            let name_ref = loader_name_ordinal(cx, cld)
                .map_or(ArtifactRef::NONE, |ordinal| cx.artifact_ref(ordinal));
            let w = cx.sink(stream);
            w.write_u64(cld.id.0);
            w.write_u64(defining.0);
            w.write_u64(name_ref.raw());
            w.note_record();
        }
    }
    1
}

/// Symbol/raw-text record: full reference plus literal text. Both
/// physical sources share this one layout.
pub fn write_text_record(
    w: &mut CheckpointWriter,
    checkpoint_id: u64,
    ordinal: u32,
    text: &str,
) -> usize {
    w.write_u64(ArtifactRef::compose(checkpoint_id, ordinal).raw());
    w.write_str(text);
    w.note_record();
    1
}
