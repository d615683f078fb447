//! Metadata object descriptors.
//!
//! Types, members, and loaders as the checkpoint engine sees them. The
//! host runtime owns these objects and they outlive any single checkpoint;
//! the engine reads their attributes and their [`TagCell`]s but never
//! mutates anything else.

use crate::interner::raw_text_hash;
use crate::tags::{Epoch, TagBits, TagCell};
use crate::Symbol;
use bitflags::bitflags;
use std::fmt;

/// Host-assigned stable identity of a type. Immutable for the type's
/// lifetime.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
#[repr(transparent)]
pub struct TypeId(pub u64);

/// Host-assigned stable identity of a loader.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
#[repr(transparent)]
pub struct LoaderId(pub u64);

/// Slot of a member within its owning type.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
#[repr(transparent)]
pub struct MemberId(pub u32);

/// A type's name in one of its two physical representations.
///
/// Canonical symbols carry identity equality; ad-hoc raw text (hidden and
/// synthesized types) is keyed by a pre-computed hash instead.
#[derive(Clone, Debug)]
pub enum TypeName {
    Symbol(Symbol),
    Raw { text: String, hash: u64 },
}

impl TypeName {
    /// Build a raw name, hashing the text with [`raw_text_hash`].
    pub fn raw(text: impl Into<String>) -> TypeName {
        let text = text.into();
        let hash = raw_text_hash(&text);
        TypeName::Raw { text, hash }
    }
}

/// Structural kind of a type.
///
/// Array types have no loader of their own; they resolve to their element
/// type for owning-loader purposes.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TypeKind {
    Instance,
    Array { element: TypeId },
    Primitive,
}

/// A loaded type descriptor.
pub struct TypeMeta {
    pub id: TypeId,
    pub loader: LoaderId,
    pub name: TypeName,
    /// Host-defined access flag bits, written through verbatim.
    pub flags: u32,
    pub kind: TypeKind,
    pub tags: TagCell,
}

impl TypeMeta {
    pub fn new(id: TypeId, loader: LoaderId, name: TypeName, flags: u32, kind: TypeKind) -> Self {
        TypeMeta {
            id,
            loader,
            name,
            flags,
            kind,
            tags: TagCell::new(),
        }
    }

    /// Event-recording mark: this type was referenced.
    pub fn tag_used(&self, epoch: &Epoch) {
        self.tags.set(TagBits::used(epoch.this_epoch()));
    }

    /// Event-recording mark for the leak-subset stream.
    pub fn tag_leak(&self, epoch: &Epoch) {
        self.tags.set(TagBits::leak(epoch.this_epoch()));
    }

    /// Event-recording mark: a member of this type was referenced.
    ///
    /// Tags the member itself and folds the member mark up into the owning
    /// type, which is what admits the type (and its member scan) into the
    /// next checkpoint.
    pub fn tag_member_used(&self, member: &MemberMeta, epoch: &Epoch) {
        let e = epoch.this_epoch();
        member.tags.set(TagBits::used(e));
        self.tags
            .set(TagBits::used(e).union(TagBits::members_used(e)));
    }

    /// Leak-subset variant of [`tag_member_used`](Self::tag_member_used).
    pub fn tag_member_leak(&self, member: &MemberMeta, epoch: &Epoch) {
        let e = epoch.this_epoch();
        member.tags.set(TagBits::used(e));
        self.tags
            .set(TagBits::leak(e).union(TagBits::members_leak(e)));
    }
}

impl fmt::Debug for TypeMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeMeta")
            .field("id", &self.id)
            .field("loader", &self.loader)
            .field("name", &self.name)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

bitflags! {
    /// Host-defined member attribute bits.
    ///
    /// Written through to member records verbatim; the engine itself only
    /// interprets `SYNTHETIC` (member-visibility filtering).
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct MemberFlags: u16 {
        const SYNTHETIC = 1 << 0;
        const STATIC    = 1 << 1;
        const NATIVE    = 1 << 2;
    }
}

/// A callable member of a type.
pub struct MemberMeta {
    pub id: MemberId,
    pub name: Symbol,
    pub signature: Symbol,
    pub flags: MemberFlags,
    pub hidden: bool,
    /// Only the `USED` pair is meaningful on member cells.
    pub tags: TagCell,
}

impl MemberMeta {
    pub fn new(id: MemberId, name: Symbol, signature: Symbol, flags: MemberFlags) -> Self {
        MemberMeta {
            id,
            name,
            signature,
            flags,
            hidden: false,
            tags: TagCell::new(),
        }
    }
}

impl fmt::Debug for MemberMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemberMeta")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

/// A loader descriptor.
///
/// Hosts publish the bootstrap loader with id 0 and no defining type;
/// type records under it carry an owning-loader id of 0.
pub struct LoaderMeta {
    pub id: LoaderId,
    /// The loader's own defining type; `None` for the bootstrap loader.
    pub defining_type: Option<TypeId>,
    /// Optional display name. Hosts do not currently publish one; the
    /// resolution path is plumbed but always finds the name absent.
    pub name: Option<String>,
    /// Anonymous loaders collapse into their defining type and are never
    /// emitted as separate artifacts.
    pub anonymous: bool,
    pub tags: TagCell,
}

impl LoaderMeta {
    pub fn new(id: LoaderId, defining_type: Option<TypeId>) -> Self {
        LoaderMeta {
            id,
            defining_type,
            name: None,
            anonymous: false,
            tags: TagCell::new(),
        }
    }
}

impl fmt::Debug for LoaderMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderMeta")
            .field("id", &self.id)
            .field("defining_type", &self.defining_type)
            .field("anonymous", &self.anonymous)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}
