use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::model::{DocumentKey, MutableDocument, Overlay, SnapshotVersion};

pub type DocumentKeySet = BTreeSet<DocumentKey>;
pub type MutableDocumentMap = BTreeMap<DocumentKey, MutableDocument>;
pub type OverlayMap = BTreeMap<DocumentKey, Overlay>;
pub type DocumentVersionMap = BTreeMap<DocumentKey, SnapshotVersion>;
