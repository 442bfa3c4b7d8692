//! Admin-task envelopes pushed by the cluster controller.
//!
//! Tasks arrive as JSON inside a packet body. The envelope's `op_code`
//! must match the packet opcode being handled; the request payload is a
//! tagged union decoded per opcode, never by structural guessing.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ProtoError, ProtoResult};
use crate::opcode::Opcode;

/// Task completion status reported back to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TaskStatus {
    /// Task executed successfully.
    Success = 0,
    /// Task failed; the result string carries the reason.
    Failed = 1,
}

/// JSON envelope wrapping a controller-issued request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminTask {
    /// Task id assigned by the controller.
    pub id: String,
    /// Opcode the task targets; must match the carrying packet.
    pub op_code: u8,
    /// Opaque request payload, decoded per opcode.
    pub request: serde_json::Value,
    /// Response payload filled by the handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
}

impl AdminTask {
    /// Decodes the request payload, first checking that the envelope's
    /// opcode matches the operation being handled.
    pub fn decode_request<T: DeserializeOwned>(&self, expected: Opcode) -> ProtoResult<T> {
        if self.op_code != expected as u8 {
            return Err(ProtoError::TaskOpcodeMismatch {
                expected: expected as u8,
                got: self.op_code,
            });
        }
        Ok(serde_json::from_value(self.request.clone())?)
    }

    /// Attaches a response payload to the envelope.
    pub fn set_response<T: Serialize>(&mut self, response: &T) -> ProtoResult<()> {
        self.response = Some(serde_json::to_value(response)?);
        Ok(())
    }
}

/// Controller request: create a data partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDataPartitionRequest {
    /// Volume the partition belongs to.
    pub volume_id: String,
    /// Partition id.
    pub partition_id: u32,
    /// Partition capacity in bytes.
    pub partition_size: u64,
    /// Partition kind label persisted in the META file.
    pub partition_type: String,
}

/// Controller request: delete a data partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteDataPartitionRequest {
    /// Partition id.
    pub partition_id: u32,
}

/// Response to a delete-partition task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteDataPartitionResponse {
    /// Partition id.
    pub partition_id: u64,
    /// Completion status.
    pub status: TaskStatus,
    /// Failure reason when status is `Failed`.
    #[serde(default)]
    pub result: String,
}

/// Controller request: load a partition and report its snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadDataPartitionRequest {
    /// Partition id.
    pub partition_id: u32,
}

/// Extent watermark entry inside a load response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionSnapshotFile {
    /// Extent id rendered as the entry file name.
    pub name: String,
    /// Header checksum over the populated block CRCs.
    pub crc: u32,
    /// Data length in bytes.
    pub size: u64,
    /// Whether the extent is tombstoned.
    pub mark_del: bool,
    /// Last modification, seconds since epoch.
    pub modified: u64,
}

/// Response to a load-partition task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadDataPartitionResponse {
    /// Partition id.
    pub partition_id: u64,
    /// Partition status code.
    pub partition_status: u8,
    /// Used bytes.
    pub used: u64,
    /// Stable extent snapshot.
    pub partition_snapshot: Vec<PartitionSnapshotFile>,
    /// Completion status.
    pub status: TaskStatus,
    /// Failure reason when status is `Failed`.
    #[serde(default)]
    pub result: String,
}

/// Controller request: heartbeat probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Controller address to report back to.
    pub master_addr: String,
}

/// Per-partition usage line inside a heartbeat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionReport {
    /// Partition id.
    pub partition_id: u64,
    /// Partition status code.
    pub partition_status: u8,
    /// Capacity in bytes.
    pub total: u64,
    /// Used bytes.
    pub used: u64,
    /// Extent count.
    pub extent_count: u64,
    /// Whether this replica believes it is the leader.
    pub is_leader: bool,
}

/// Heartbeat response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Total capacity across disks, bytes.
    pub total: u64,
    /// Used bytes across disks.
    pub used: u64,
    /// Per-partition reports.
    pub partition_reports: Vec<PartitionReport>,
    /// Completion status.
    pub status: TaskStatus,
    /// Failure reason when status is `Failed`.
    #[serde(default)]
    pub result: String,
}

/// Runtime metrics body returned by `GetDataPartitionMetrics`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataPartitionMetricsResponse {
    /// Mean write latency over the last window, microseconds.
    pub write_latency_us: u64,
    /// Mean read latency over the last window, microseconds.
    pub read_latency_us: u64,
    /// Writes observed in the last window.
    pub write_count: u64,
    /// Reads observed in the last window.
    pub read_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_request_checks_opcode() {
        let task = AdminTask {
            id: "t1".into(),
            op_code: Opcode::CreateDataPartition as u8,
            request: serde_json::json!({
                "volume_id": "vol1",
                "partition_id": 7,
                "partition_size": 1u64 << 30,
                "partition_type": "extent",
            }),
            response: None,
        };
        let req: CreateDataPartitionRequest =
            task.decode_request(Opcode::CreateDataPartition).unwrap();
        assert_eq!(req.partition_id, 7);
        assert_eq!(req.volume_id, "vol1");

        let err = task
            .decode_request::<CreateDataPartitionRequest>(Opcode::DeleteDataPartition)
            .unwrap_err();
        assert!(matches!(err, ProtoError::TaskOpcodeMismatch { .. }));
    }

    #[test]
    fn test_set_response_roundtrip() {
        let mut task = AdminTask {
            id: "t2".into(),
            op_code: Opcode::DeleteDataPartition as u8,
            request: serde_json::json!({ "partition_id": 3 }),
            response: None,
        };
        task.set_response(&DeleteDataPartitionResponse {
            partition_id: 3,
            status: TaskStatus::Success,
            result: String::new(),
        })
        .unwrap();
        let encoded = serde_json::to_vec(&task).unwrap();
        let decoded: AdminTask = serde_json::from_slice(&encoded).unwrap();
        let resp: DeleteDataPartitionResponse =
            serde_json::from_value(decoded.response.unwrap()).unwrap();
        assert_eq!(resp.status, TaskStatus::Success);
    }
}
