//! Collection metadata table.
//!
//! The root coordinator exclusively owns collection, partition, and
//! index-descriptor rows. Every DDL mutation commits in one meta-store
//! transaction together with the DDL replay slot (`/meta/dd-op`,
//! `/meta/dd-sent`), so a crash between commit and publish is recoverable.

use parking_lot::RwLock;
use quiver_common::types::{FieldId, Timestamp, UniqueId};
use quiver_common::{Error, Result};
use quiver_kv::MetaKv;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

pub const COLLECTION_PREFIX: &str = "/meta/collections/";
pub const SEGMENT_INDEX_PREFIX: &str = "/meta/segment-indexes/";
pub const DD_OP_KEY: &str = "/meta/dd-op";
pub const DD_SENT_KEY: &str = "/meta/dd-sent";

/// User field ids start here; lower ids are reserved for system columns.
pub const START_OF_USER_FIELD_ID: FieldId = 100;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Float,
    Double,
    VarChar,
    FloatVector,
    BinaryVector,
}

impl DataType {
    pub fn is_vector(&self) -> bool {
        matches!(self, DataType::FloatVector | DataType::BinaryVector)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub field_id: FieldId,
    pub name: String,
    pub data_type: DataType,
    pub is_primary_key: bool,
    #[serde(default)]
    pub type_params: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub fields: Vec<FieldSchema>,
}

impl CollectionSchema {
    /// Schema validation: exactly one int64 primary key; vector fields
    /// declare a dimension.
    pub fn validate(&self) -> Result<()> {
        if self.fields.is_empty() {
            return Err(Error::InvalidInput("schema has no fields".into()));
        }
        let pks: Vec<&FieldSchema> = self.fields.iter().filter(|f| f.is_primary_key).collect();
        if pks.len() != 1 {
            return Err(Error::InvalidInput(format!(
                "schema must declare exactly one primary key, found {}",
                pks.len()
            )));
        }
        if pks[0].data_type != DataType::Int64 {
            return Err(Error::InvalidInput("primary key must be int64".into()));
        }
        for field in &self.fields {
            if field.data_type.is_vector() {
                let dim = field
                    .type_params
                    .get("dim")
                    .ok_or_else(|| {
                        Error::InvalidInput(format!("vector field {} missing dim", field.name))
                    })?;
                dim.parse::<usize>().map_err(|_| {
                    Error::InvalidInput(format!("vector field {} has non-numeric dim", field.name))
                })?;
            }
        }
        Ok(())
    }

    pub fn primary_key(&self) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.is_primary_key)
    }

    pub fn field_by_id(&self, field_id: FieldId) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.field_id == field_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub partition_id: UniqueId,
    pub name: String,
}

/// Per-field index descriptor owned by the collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub index_id: UniqueId,
    pub index_name: String,
    pub field_id: FieldId,
    #[serde(default)]
    pub index_params: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub id: UniqueId,
    pub schema: CollectionSchema,
    pub partitions: Vec<PartitionInfo>,
    /// Physical message channels, fixed at create time.
    pub physical_channels: Vec<String>,
    #[serde(default)]
    pub field_indexes: Vec<IndexInfo>,
    /// Timestamp the create-collection message was stamped with.
    pub created_ts: Timestamp,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Relation between a flushed segment and an index descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentIndexInfo {
    pub collection_id: UniqueId,
    pub partition_id: UniqueId,
    pub segment_id: UniqueId,
    pub field_id: FieldId,
    pub index_id: UniqueId,
    pub build_id: UniqueId,
    pub enable_index: bool,
}

/// The last DDL applied, persisted before its messages are published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DdOperation {
    pub op_type: String,
    pub body: String,
}

pub const CREATE_COLLECTION_DD_TYPE: &str = "CreateCollection";
pub const DROP_COLLECTION_DD_TYPE: &str = "DropCollection";
pub const CREATE_PARTITION_DD_TYPE: &str = "CreatePartition";
pub const DROP_PARTITION_DD_TYPE: &str = "DropPartition";

fn collection_key(collection_id: UniqueId) -> String {
    format!("{COLLECTION_PREFIX}{collection_id}")
}

fn segment_index_key(segment_id: UniqueId, index_id: UniqueId) -> String {
    format!("{SEGMENT_INDEX_PREFIX}{segment_id}/{index_id}")
}

#[derive(Default)]
struct MetaState {
    collections: HashMap<UniqueId, CollectionInfo>,
    name_index: HashMap<String, UniqueId>,
    /// segment-id → index-id → row
    segment_indexes: HashMap<UniqueId, HashMap<UniqueId, SegmentIndexInfo>>,
}

/// In-memory view of the root coordinator's metadata, persisted through the
/// meta store. No lock is held across store I/O: mutations prepare the
/// transaction, commit it, then apply to memory.
pub struct MetaTable {
    kv: Arc<dyn MetaKv>,
    state: RwLock<MetaState>,
}

impl MetaTable {
    pub async fn new(kv: Arc<dyn MetaKv>) -> Result<Self> {
        let table = Self { kv, state: RwLock::new(MetaState::default()) };
        table.reload().await?;
        Ok(table)
    }

    async fn reload(&self) -> Result<()> {
        let (pairs, _) = self.kv.load_with_prefix(COLLECTION_PREFIX).await?;
        let mut state = MetaState::default();
        for (key, value) in pairs {
            match serde_json::from_str::<CollectionInfo>(&value) {
                Ok(info) => {
                    state.name_index.insert(info.schema.name.clone(), info.id);
                    state.collections.insert(info.id, info);
                }
                Err(e) => warn!(key = %key, error = %e, "skipping undecodable collection row"),
            }
        }
        let (pairs, _) = self.kv.load_with_prefix(SEGMENT_INDEX_PREFIX).await?;
        for (key, value) in pairs {
            match serde_json::from_str::<SegmentIndexInfo>(&value) {
                Ok(row) => {
                    state
                        .segment_indexes
                        .entry(row.segment_id)
                        .or_default()
                        .insert(row.index_id, row);
                }
                Err(e) => warn!(key = %key, error = %e, "skipping undecodable segment-index row"),
            }
        }
        *self.state.write() = state;
        Ok(())
    }

    /// Commit a new collection together with the DDL replay slot.
    pub async fn add_collection(&self, info: CollectionInfo, dd_op: &DdOperation) -> Result<()> {
        {
            let state = self.state.read();
            if state.name_index.contains_key(&info.schema.name) {
                return Err(Error::AlreadyExists(format!("collection {}", info.schema.name)));
            }
        }
        let mut saves = HashMap::new();
        saves.insert(collection_key(info.id), serde_json::to_string(&info)?);
        saves.insert(DD_OP_KEY.to_string(), serde_json::to_string(dd_op)?);
        saves.insert(DD_SENT_KEY.to_string(), "false".to_string());
        self.kv.multi_save(saves).await?;

        let mut state = self.state.write();
        state.name_index.insert(info.schema.name.clone(), info.id);
        state.collections.insert(info.id, info);
        Ok(())
    }

    /// Remove a collection (and its segment-index rows) together with the
    /// DDL replay slot. Returns the removed descriptor.
    pub async fn drop_collection(&self, name: &str, dd_op: &DdOperation) -> Result<CollectionInfo> {
        let info = self.collection_by_name(name)?;

        let mut removals = vec![collection_key(info.id)];
        {
            let state = self.state.read();
            for rows in state.segment_indexes.values() {
                for row in rows.values() {
                    if row.collection_id == info.id {
                        removals.push(segment_index_key(row.segment_id, row.index_id));
                    }
                }
            }
        }
        let mut saves = HashMap::new();
        saves.insert(DD_OP_KEY.to_string(), serde_json::to_string(dd_op)?);
        saves.insert(DD_SENT_KEY.to_string(), "false".to_string());
        self.kv.multi_save_and_remove(saves, removals).await?;

        let mut state = self.state.write();
        state.name_index.remove(name);
        state.collections.remove(&info.id);
        state.segment_indexes.retain(|_, rows| {
            rows.retain(|_, row| row.collection_id != info.id);
            !rows.is_empty()
        });
        Ok(info)
    }

    /// Append a partition to a collection, with the DDL replay slot.
    pub async fn add_partition(
        &self,
        collection_id: UniqueId,
        partition: PartitionInfo,
        dd_op: &DdOperation,
    ) -> Result<()> {
        let mut info = self.collection_by_id(collection_id)?;
        if info.partitions.iter().any(|p| p.name == partition.name) {
            return Err(Error::AlreadyExists(format!("partition {}", partition.name)));
        }
        info.partitions.push(partition);

        let mut saves = HashMap::new();
        saves.insert(collection_key(info.id), serde_json::to_string(&info)?);
        saves.insert(DD_OP_KEY.to_string(), serde_json::to_string(dd_op)?);
        saves.insert(DD_SENT_KEY.to_string(), "false".to_string());
        self.kv.multi_save(saves).await?;

        self.state.write().collections.insert(info.id, info);
        Ok(())
    }

    pub async fn drop_partition(
        &self,
        collection_id: UniqueId,
        partition_name: &str,
        dd_op: &DdOperation,
    ) -> Result<PartitionInfo> {
        let mut info = self.collection_by_id(collection_id)?;
        let idx = info
            .partitions
            .iter()
            .position(|p| p.name == partition_name)
            .ok_or_else(|| Error::NotFound(format!("partition {partition_name}")))?;
        if info.partitions.len() == 1 {
            return Err(Error::InvalidInput("cannot drop the last partition".into()));
        }
        let removed = info.partitions.remove(idx);

        let mut saves = HashMap::new();
        saves.insert(collection_key(info.id), serde_json::to_string(&info)?);
        saves.insert(DD_OP_KEY.to_string(), serde_json::to_string(dd_op)?);
        saves.insert(DD_SENT_KEY.to_string(), "false".to_string());
        self.kv.multi_save(saves).await?;

        self.state.write().collections.insert(info.id, info);
        Ok(removed)
    }

    /// Attach an index descriptor to a collection field.
    pub async fn add_index(&self, collection_id: UniqueId, index: IndexInfo) -> Result<()> {
        let mut info = self.collection_by_id(collection_id)?;
        if info.field_indexes.iter().any(|i| i.field_id == index.field_id) {
            return Err(Error::AlreadyExists(format!("index on field {}", index.field_id)));
        }
        info.field_indexes.push(index);
        self.kv.save(&collection_key(info.id), &serde_json::to_string(&info)?).await?;
        self.state.write().collections.insert(info.id, info);
        Ok(())
    }

    /// Detach an index descriptor, dropping its segment-index rows too.
    pub async fn remove_index(
        &self,
        collection_id: UniqueId,
        index_id: UniqueId,
    ) -> Result<IndexInfo> {
        let mut info = self.collection_by_id(collection_id)?;
        let idx = info
            .field_indexes
            .iter()
            .position(|i| i.index_id == index_id)
            .ok_or_else(|| Error::NotFound(format!("index {index_id}")))?;
        let removed = info.field_indexes.remove(idx);

        let mut removals = Vec::new();
        {
            let state = self.state.read();
            for rows in state.segment_indexes.values() {
                for row in rows.values() {
                    if row.index_id == index_id {
                        removals.push(segment_index_key(row.segment_id, row.index_id));
                    }
                }
            }
        }
        let mut saves = HashMap::new();
        saves.insert(collection_key(info.id), serde_json::to_string(&info)?);
        self.kv.multi_save_and_remove(saves, removals).await?;

        let mut state = self.state.write();
        state.collections.insert(info.id, info);
        state.segment_indexes.retain(|_, rows| {
            rows.retain(|_, row| row.index_id != index_id);
            !rows.is_empty()
        });
        Ok(removed)
    }

    pub async fn add_segment_index(&self, row: SegmentIndexInfo) -> Result<()> {
        self.kv
            .save(&segment_index_key(row.segment_id, row.index_id), &serde_json::to_string(&row)?)
            .await?;
        self.state
            .write()
            .segment_indexes
            .entry(row.segment_id)
            .or_default()
            .insert(row.index_id, row);
        Ok(())
    }

    pub fn is_segment_indexed(&self, segment_id: UniqueId, index_id: UniqueId) -> bool {
        self.state
            .read()
            .segment_indexes
            .get(&segment_id)
            .map(|rows| rows.contains_key(&index_id))
            .unwrap_or(false)
    }

    pub fn segment_index_rows(&self, segment_id: UniqueId) -> Vec<SegmentIndexInfo> {
        self.state
            .read()
            .segment_indexes
            .get(&segment_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn collection_by_name(&self, name: &str) -> Result<CollectionInfo> {
        let state = self.state.read();
        let id = state
            .name_index
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("collection {name}")))?;
        Ok(state.collections[id].clone())
    }

    pub fn collection_by_id(&self, collection_id: UniqueId) -> Result<CollectionInfo> {
        self.state
            .read()
            .collections
            .get(&collection_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("collection {collection_id}")))
    }

    pub fn has_collection(&self, name: &str) -> bool {
        self.state.read().name_index.contains_key(name)
    }

    pub fn list_collections(&self) -> Vec<(String, UniqueId)> {
        let state = self.state.read();
        let mut out: Vec<(String, UniqueId)> =
            state.name_index.iter().map(|(n, id)| (n.clone(), *id)).collect();
        out.sort();
        out
    }

    /// Every physical channel of every collection, deduplicated.
    pub fn list_physical_channels(&self) -> Vec<String> {
        let state = self.state.read();
        let mut channels: Vec<String> = state
            .collections
            .values()
            .flat_map(|c| c.physical_channels.iter().cloned())
            .collect();
        channels.sort();
        channels.dedup();
        channels
    }

    // --- DDL replay slot ---

    pub async fn dd_msg_sent(&self) -> Result<Option<bool>> {
        Ok(self.kv.load(DD_SENT_KEY).await?.map(|v| v == "true"))
    }

    pub async fn set_dd_msg_sent(&self, sent: bool) -> Result<()> {
        self.kv.save(DD_SENT_KEY, if sent { "true" } else { "false" }).await?;
        Ok(())
    }

    pub async fn load_dd_operation(&self) -> Result<Option<DdOperation>> {
        match self.kv.load(DD_OP_KEY).await? {
            Some(v) => Ok(Some(serde_json::from_str(&v)?)),
            None => Ok(None),
        }
    }
}
