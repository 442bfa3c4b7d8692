//! Multipart operations applied by the state machine.

use tidefs_proto::ResultCode;

use crate::error::MetaResult;
use crate::fsm::FsmResponse;
use crate::multipart::Multipart;
use crate::partition::MetaPartition;

impl MetaPartition {
    /// Inserts an upload record; an exact `(path, id)` duplicate is
    /// `ExistErr`.
    pub(crate) fn fsm_create_multipart(&self, multipart: Multipart) -> MetaResult<FsmResponse> {
        if self.multiparts.create(&multipart)? {
            Ok(FsmResponse::Status(ResultCode::Ok))
        } else {
            Ok(FsmResponse::Status(ResultCode::ExistErr))
        }
    }

    /// Records one uploaded part; a re-uploaded part number replaces the
    /// earlier upload.
    pub(crate) fn fsm_append_multipart(&self, request: Multipart) -> MetaResult<FsmResponse> {
        let Some(mut stored) = self.multiparts.get(&request.path, &request.id)? else {
            return Ok(FsmResponse::Status(ResultCode::NotExistErr));
        };
        for part in request.parts {
            stored.insert_part(part);
        }
        self.multiparts.put(&stored)?;
        Ok(FsmResponse::Status(ResultCode::Ok))
    }

    /// Removes an upload record.
    pub(crate) fn fsm_remove_multipart(&self, request: &Multipart) -> MetaResult<FsmResponse> {
        if self.multiparts.delete(&request.path, &request.id)? {
            Ok(FsmResponse::Status(ResultCode::Ok))
        } else {
            Ok(FsmResponse::Status(ResultCode::NotExistErr))
        }
    }

    /// Fetches one upload record.
    pub fn get_multipart(&self, path: &str, id: &str) -> MetaResult<Option<Multipart>> {
        self.multiparts.get(path, id)
    }

    /// Lists uploads by prefix with pagination.
    pub fn list_multiparts(
        &self,
        prefix: &str,
        marker: &str,
        id_marker: &str,
        max: usize,
    ) -> MetaResult<Vec<Multipart>> {
        self.multiparts.list(prefix, marker, id_marker, max)
    }
}
