//! `FolderTreeDocument`: one CRDT document per SD holding the folder tree -
//! a map from folder id to `{name, parentId, order, deleted}`.

use crate::error::CodecError;
use crate::ids::{FolderId, SdId};
use crate::origin::Origin;
use serde::{Deserialize, Serialize};
use yrs::updates::decoder::Decode;
use yrs::{Doc, Map, MapPrelim, MapRef, Options, ReadTxn, StateVector, Transact, Update};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct FolderEntry {
    pub name: String,
    pub parent_id: Option<String>,
    pub order: i64,
    pub deleted: bool,
}

pub struct FolderTreeDocument {
    sd_id: SdId,
    doc: Doc,
    folders: MapRef,
}

impl FolderTreeDocument {
    pub fn new(sd_id: SdId) -> Self {
        let mut options = Options::default();
        options.client_id = rand::random::<u64>().max(1);
        let doc = Doc::with_options(options);
        let folders = doc.get_or_insert_map("folders");
        Self { sd_id, doc, folders }
    }

    pub fn from_state(sd_id: SdId, state: &[u8]) -> Result<Self, CodecError> {
        let mut this = Self::new(sd_id);
        if !state.is_empty() {
            this.apply_update(state, Origin::Load)?;
        }
        Ok(this)
    }

    pub fn sd_id(&self) -> SdId {
        self.sd_id
    }

    pub fn apply_update(&mut self, update: &[u8], _origin: Origin) -> Result<(), CodecError> {
        let update = Update::decode_v1(update).map_err(|e| CodecError::Crdt(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update).map_err(|e| CodecError::Crdt(e.to_string()))?;
        Ok(())
    }

    pub fn export_update(&self, state_vector: Option<&StateVector>) -> Vec<u8> {
        let txn = self.doc.transact();
        match state_vector {
            Some(sv) => txn.encode_diff_v1(sv),
            None => txn.encode_state_as_update_v1(&StateVector::default()),
        }
    }

    pub fn export_snapshot(&self) -> Vec<u8> {
        self.export_update(None)
    }

    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    pub fn upsert_folder(&mut self, id: FolderId, entry: &FolderEntry) {
        let mut txn = self.doc.transact_mut();
        let map: MapRef = self.folders.insert(&mut txn, id.to_string(), MapPrelim::default());
        map.insert(&mut txn, "name", entry.name.clone());
        if let Some(parent) = &entry.parent_id {
            map.insert(&mut txn, "parentId", parent.clone());
        }
        map.insert(&mut txn, "order", entry.order);
        map.insert(&mut txn, "deleted", entry.deleted);
    }

    pub fn mark_deleted(&mut self, id: FolderId) {
        let txn = self.doc.transact();
        let existing = self.folders.get(&txn, &id.to_string());
        drop(txn);
        if let Some(yrs::Out::YMap(map)) = existing {
            let mut txn = self.doc.transact_mut();
            map.insert(&mut txn, "deleted", true);
        }
    }

    pub fn get_folder(&self, id: FolderId) -> Option<FolderEntry> {
        let txn = self.doc.transact();
        let yrs::Out::YMap(map) = self.folders.get(&txn, &id.to_string())? else {
            return None;
        };
        Some(FolderEntry {
            name: map.get(&txn, "name").map(|v| v.to_string(&txn)).unwrap_or_default(),
            parent_id: map.get(&txn, "parentId").map(|v| v.to_string(&txn)),
            order: map
                .get(&txn, "order")
                .and_then(|v| v.to_string(&txn).parse().ok())
                .unwrap_or(0),
            deleted: map
                .get(&txn, "deleted")
                .map(|v| v.to_string(&txn) == "true")
                .unwrap_or(false),
        })
    }

    pub fn list_folder_ids(&self) -> Vec<String> {
        let txn = self.doc.transact();
        self.folders.keys(&txn).map(|k| k.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_and_read_back() {
        let mut tree = FolderTreeDocument::new(SdId::new());
        let id = FolderId::new();
        tree.upsert_folder(id, &FolderEntry { name: "Work".into(), parent_id: None, order: 0, deleted: false });
        let entry = tree.get_folder(id).unwrap();
        assert_eq!(entry.name, "Work");
        assert!(!entry.deleted);
    }

    #[test]
    fn mark_deleted_flips_the_flag() {
        let mut tree = FolderTreeDocument::new(SdId::new());
        let id = FolderId::new();
        tree.upsert_folder(id, &FolderEntry { name: "Archive".into(), parent_id: None, order: 1, deleted: false });
        tree.mark_deleted(id);
        assert!(tree.get_folder(id).unwrap().deleted);
    }

    #[test]
    fn export_update_applies_to_a_fresh_replica() {
        let sd_id = SdId::new();
        let mut writer = FolderTreeDocument::new(sd_id);
        let id = FolderId::new();
        writer.upsert_folder(id, &FolderEntry { name: "Notes".into(), parent_id: None, order: 0, deleted: false });
        let update = writer.export_update(None);

        let mut reader = FolderTreeDocument::new(sd_id);
        reader.apply_update(&update, Origin::Reload).unwrap();
        assert_eq!(reader.get_folder(id).unwrap().name, "Notes");
    }
}
