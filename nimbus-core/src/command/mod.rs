//! The command vocabulary exchanged between the controller and workers.
//!
//! The protocol is a closed set of message kinds with a shared framing: a
//! one-byte kind tag, a little-endian u32 payload length, and a payload
//! produced by the configured [`Serializer`]. Messages are plain value types
//! with explicit `Clone`; the core consumes and emits them and treats wire
//! bytes as opaque.
//!
//! Commands flow in two directions. [`ControllerCommand`]s travel upward
//! from application code on a worker to the controller: spawns, data
//! definitions, completion reports, template boundaries, and termination
//! requests. [`WorkerCommand`]s travel downward: resolved compute and copy
//! work with physical ids substituted for logical ones, data creation,
//! checkpoint save/load, and template lifecycle messages. Both participants
//! must handle messages that lag the state of the world: a duplicate
//! completion report is a no-op, and a stale template generation is
//! discarded by the receiver.
//!
//! [`DataMessage`] is the worker-to-worker data plane: the payload of a
//! remote copy, tagged with the generation and receive-job routing keys.

use std::collections::BTreeSet;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    geometry::GeometricRegion,
    ids::{
        CheckpointId, DataVersion, ExitStatus, JobId, LogicalDataId, PartitionId, PhysicalDataId,
        TemplateGenerationId, WorkerId,
    },
    serializer::Serializer,
};

/// Opaque parameter blob attached to tasks.
pub type Params = Bytes;

/// Identifies a template instantiation on every message belonging to it.
///
/// The controller assigns generation ids in instantiation order, imposing a
/// total order on identically-named instantiations. Receivers discard events
/// tagged with an older generation and buffer newer ones.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemplateTag {
    pub name: String,
    pub generation: TemplateGenerationId,
}

/// What a worker brings to the cluster, reported at handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    pub instance_capacity: usize,
    pub threads: usize,
}

// ---------------------------------------------------------------------------
// Worker -> controller payloads.
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    /// Present when re-registering after a reconnect.
    pub worker_id: Option<WorkerId>,
    pub address: String,
    pub port: u16,
    pub capabilities: WorkerCapabilities,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpawnCompute {
    pub name: String,
    pub job_id: JobId,
    pub read: BTreeSet<LogicalDataId>,
    pub write: BTreeSet<LogicalDataId>,
    pub before: BTreeSet<JobId>,
    pub after: BTreeSet<JobId>,
    pub parent: JobId,
    pub future: Option<JobId>,
    pub sterile: bool,
    pub region: Option<GeometricRegion>,
    pub params: Params,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpawnCopy {
    pub job_id: JobId,
    pub from_ldo: LogicalDataId,
    pub to_ldo: LogicalDataId,
    pub before: BTreeSet<JobId>,
    pub after: BTreeSet<JobId>,
    pub parent: JobId,
    pub params: Params,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DefineData {
    pub name: String,
    pub ldo: LogicalDataId,
    pub partition: PartitionId,
    pub neighbors: Vec<PartitionId>,
    pub parent: JobId,
    pub params: Params,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DefinePartition {
    pub partition: PartitionId,
    pub region: GeometricRegion,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobDone {
    pub job_id: JobId,
    pub after: BTreeSet<JobId>,
    pub params: Params,
    pub run_time: f64,
    pub wait_time: f64,
    /// Set when the kernel reported failure rather than completing.
    pub failed: bool,
}

/// Roll-up completion for a whole template instantiation on one worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MegaJobDone {
    pub job_ids: Vec<JobId>,
    pub template: TemplateTag,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SaveDataDone {
    pub job_id: JobId,
    pub checkpoint: CheckpointId,
    /// Worker-interpreted handle to the persisted snapshot.
    pub handle: Bytes,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StartTemplate {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EndTemplate {
    pub name: String,
}

/// Fast-path instantiation of a finalized template.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpawnTemplate {
    pub name: String,
    pub inner: Vec<JobId>,
    pub outer: Vec<JobId>,
    pub params: Vec<Params>,
    pub parent: JobId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Terminate {
    pub exit_status: ExitStatus,
}

/// Messages from workers (application side) to the controller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ControllerCommand {
    Handshake(Handshake),
    SpawnCompute(SpawnCompute),
    SpawnCopy(SpawnCopy),
    DefineData(DefineData),
    DefinePartition(DefinePartition),
    JobDone(JobDone),
    MegaJobDone(MegaJobDone),
    SaveDataDone(SaveDataDone),
    StartTemplate(StartTemplate),
    EndTemplate(EndTemplate),
    SpawnTemplate(SpawnTemplate),
    Terminate(Terminate),
}

// ---------------------------------------------------------------------------
// Controller -> worker payloads.
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub worker_id: WorkerId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComputeJob {
    pub name: String,
    pub job_id: JobId,
    pub read: Vec<PhysicalDataId>,
    pub write: Vec<PhysicalDataId>,
    pub before: BTreeSet<JobId>,
    pub after: BTreeSet<JobId>,
    pub params: Params,
    pub template: Option<TemplateTag>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalCopy {
    pub job_id: JobId,
    pub from: PhysicalDataId,
    pub to: PhysicalDataId,
    pub before: BTreeSet<JobId>,
    pub after: BTreeSet<JobId>,
    pub template: Option<TemplateTag>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteCopySend {
    pub job_id: JobId,
    /// One receive per consumer on the destination worker; several receives
    /// may be multiplexed into a single mega receive there.
    pub receive_job_ids: Vec<JobId>,
    pub from: PhysicalDataId,
    pub to_worker: WorkerId,
    pub before: BTreeSet<JobId>,
    pub after: BTreeSet<JobId>,
    pub template: Option<TemplateTag>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteCopyReceive {
    pub job_id: JobId,
    pub to: PhysicalDataId,
    pub before: BTreeSet<JobId>,
    pub after: BTreeSet<JobId>,
    pub template: Option<TemplateTag>,
}

/// A batched remote-copy-receive multiplexing several incoming transfers
/// into one task node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MegaRcr {
    pub job_id: JobId,
    pub receives: Vec<(JobId, PhysicalDataId)>,
    pub before: BTreeSet<JobId>,
    pub after: BTreeSet<JobId>,
    pub template: Option<TemplateTag>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CombineJob {
    pub job_id: JobId,
    pub scratch: Vec<PhysicalDataId>,
    pub reduce: Vec<PhysicalDataId>,
    pub before: BTreeSet<JobId>,
    pub after: BTreeSet<JobId>,
    pub template: Option<TemplateTag>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateData {
    pub name: String,
    pub ldo: LogicalDataId,
    pub job_id: JobId,
    pub before: BTreeSet<JobId>,
    pub after: BTreeSet<JobId>,
    pub pdi: PhysicalDataId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SaveData {
    pub job_id: JobId,
    pub checkpoint: CheckpointId,
    pub from: PhysicalDataId,
    pub ldo: LogicalDataId,
    pub version: DataVersion,
    pub before: BTreeSet<JobId>,
    pub after: BTreeSet<JobId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoadData {
    pub job_id: JobId,
    pub to: PhysicalDataId,
    pub handle: Bytes,
    pub before: BTreeSet<JobId>,
    pub after: BTreeSet<JobId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FinalizeTemplate {
    pub name: String,
}

/// Hot-path parameter refresh of a finalized execution template.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstantiateTemplate {
    pub name: String,
    pub inner: Vec<JobId>,
    pub outer: Vec<JobId>,
    pub extra_dependency: BTreeSet<JobId>,
    pub params: Vec<Params>,
    pub physical: Vec<PhysicalDataId>,
    pub generation: TemplateGenerationId,
}

/// Puts execution templates into rewind mode: completions stop firing
/// downstream until the controller reinstantiates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrepareRewind {
    pub templates: Vec<String>,
}

/// Relays the completion of a job another worker (or a previous frame)
/// produced, so execution templates can clear outer and extra dependencies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDoneRelay {
    pub job_id: JobId,
}

/// Messages from the controller to a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WorkerCommand {
    HandshakeAck(HandshakeAck),
    ComputeJob(ComputeJob),
    LocalCopy(LocalCopy),
    RemoteCopySend(RemoteCopySend),
    RemoteCopyReceive(RemoteCopyReceive),
    MegaRcr(MegaRcr),
    CombineJob(CombineJob),
    CreateData(CreateData),
    SaveData(SaveData),
    LoadData(LoadData),
    FinalizeTemplate(FinalizeTemplate),
    InstantiateTemplate(InstantiateTemplate),
    PrepareRewind(PrepareRewind),
    JobDoneRelay(JobDoneRelay),
    Terminate(Terminate),
}

/// Worker-to-worker data delivery for a remote copy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataMessage {
    pub generation: TemplateGenerationId,
    pub receive_job_id: JobId,
    pub to_physical_id: PhysicalDataId,
    pub data: Bytes,
}

// ---------------------------------------------------------------------------
// Framing.
// ---------------------------------------------------------------------------

const HEADER_LEN: usize = 5;
const DATA_MESSAGE_TAG: u8 = 200;

fn encode_frame(tag: u8, payload: &[u8]) -> Bytes {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(tag);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    Bytes::from(frame)
}

fn split_frame(frame: &[u8]) -> Result<(u8, &[u8])> {
    if frame.len() < HEADER_LEN {
        bail!("frame shorter than header: {} bytes", frame.len());
    }
    let tag = frame[0];
    let len = u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
    let payload = &frame[HEADER_LEN..];
    if payload.len() != len {
        bail!("frame length mismatch: header says {len}, payload is {}", payload.len());
    }
    Ok((tag, payload))
}

impl ControllerCommand {
    /// Kind tag identifying the message on the wire.
    pub fn tag(&self) -> u8 {
        match self {
            Self::Handshake(_) => 1,
            Self::SpawnCompute(_) => 2,
            Self::SpawnCopy(_) => 3,
            Self::DefineData(_) => 4,
            Self::DefinePartition(_) => 5,
            Self::JobDone(_) => 6,
            Self::MegaJobDone(_) => 7,
            Self::SaveDataDone(_) => 8,
            Self::StartTemplate(_) => 9,
            Self::EndTemplate(_) => 10,
            Self::SpawnTemplate(_) => 11,
            Self::Terminate(_) => 12,
        }
    }

    pub fn to_frame(&self, serializer: Serializer) -> Result<Bytes> {
        let payload = serializer.to_bytes(self)?;
        Ok(encode_frame(self.tag(), &payload))
    }

    pub fn from_frame(frame: &[u8], serializer: Serializer) -> Result<Self> {
        let (tag, payload) = split_frame(frame)?;
        let command: Self = serializer
            .from_bytes(payload)
            .context("decoding controller command payload")?;
        if command.tag() != tag {
            bail!("frame tag {tag} does not match decoded kind {}", command.tag());
        }
        Ok(command)
    }
}

impl WorkerCommand {
    /// Kind tag identifying the message on the wire.
    pub fn tag(&self) -> u8 {
        match self {
            Self::HandshakeAck(_) => 101,
            Self::ComputeJob(_) => 102,
            Self::LocalCopy(_) => 103,
            Self::RemoteCopySend(_) => 104,
            Self::RemoteCopyReceive(_) => 105,
            Self::MegaRcr(_) => 106,
            Self::CombineJob(_) => 107,
            Self::CreateData(_) => 108,
            Self::SaveData(_) => 109,
            Self::LoadData(_) => 110,
            Self::FinalizeTemplate(_) => 111,
            Self::InstantiateTemplate(_) => 112,
            Self::PrepareRewind(_) => 113,
            Self::JobDoneRelay(_) => 114,
            Self::Terminate(_) => 115,
        }
    }

    pub fn to_frame(&self, serializer: Serializer) -> Result<Bytes> {
        let payload = serializer.to_bytes(self)?;
        Ok(encode_frame(self.tag(), &payload))
    }

    pub fn from_frame(frame: &[u8], serializer: Serializer) -> Result<Self> {
        let (tag, payload) = split_frame(frame)?;
        let command: Self = serializer
            .from_bytes(payload)
            .context("decoding worker command payload")?;
        if command.tag() != tag {
            bail!("frame tag {tag} does not match decoded kind {}", command.tag());
        }
        Ok(command)
    }
}

impl DataMessage {
    pub fn to_frame(&self, serializer: Serializer) -> Result<Bytes> {
        let payload = serializer.to_bytes(self)?;
        Ok(encode_frame(DATA_MESSAGE_TAG, &payload))
    }

    pub fn from_frame(frame: &[u8], serializer: Serializer) -> Result<Self> {
        let (tag, payload) = split_frame(frame)?;
        if tag != DATA_MESSAGE_TAG {
            bail!("not a data message: tag {tag}");
        }
        serializer
            .from_bytes(payload)
            .context("decoding data message payload")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[u64]) -> BTreeSet<u64> {
        ids.iter().copied().collect()
    }

    fn controller_commands() -> Vec<ControllerCommand> {
        vec![
            ControllerCommand::Handshake(Handshake {
                worker_id: None,
                address: "10.0.0.7".into(),
                port: 5801,
                capabilities: WorkerCapabilities {
                    instance_capacity: 64,
                    threads: 4,
                },
            }),
            ControllerCommand::SpawnCompute(SpawnCompute {
                name: "advect".into(),
                job_id: 10,
                read: set(&[1, 2]),
                write: set(&[2]),
                before: set(&[8, 9]),
                after: set(&[]),
                parent: crate::ids::ROOT_JOB_ID,
                future: None,
                sterile: true,
                region: Some(GeometricRegion::new(0, 0, 0, 8, 8, 8)),
                params: Bytes::from_static(b"\x01\x02"),
            }),
            ControllerCommand::SpawnCopy(SpawnCopy {
                job_id: 11,
                from_ldo: 1,
                to_ldo: 2,
                before: set(&[10]),
                after: set(&[]),
                parent: crate::ids::ROOT_JOB_ID,
                params: Bytes::new(),
            }),
            ControllerCommand::DefineData(DefineData {
                name: "velocity-0".into(),
                ldo: 1,
                partition: 0,
                neighbors: vec![1, 2],
                parent: crate::ids::ROOT_JOB_ID,
                params: Bytes::new(),
            }),
            ControllerCommand::DefinePartition(DefinePartition {
                partition: 0,
                region: GeometricRegion::new(0, 0, 0, 16, 16, 16),
            }),
            ControllerCommand::JobDone(JobDone {
                job_id: 10,
                after: set(&[12]),
                params: Bytes::new(),
                run_time: 0.25,
                wait_time: 0.01,
                failed: false,
            }),
            ControllerCommand::MegaJobDone(MegaJobDone {
                job_ids: vec![20, 21, 22],
                template: TemplateTag {
                    name: "frame".into(),
                    generation: 3,
                },
            }),
            ControllerCommand::SaveDataDone(SaveDataDone {
                job_id: 30,
                checkpoint: 1,
                handle: Bytes::from_static(b"snap-000042"),
            }),
            ControllerCommand::StartTemplate(StartTemplate { name: "frame".into() }),
            ControllerCommand::EndTemplate(EndTemplate { name: "frame".into() }),
            ControllerCommand::SpawnTemplate(SpawnTemplate {
                name: "frame".into(),
                inner: vec![40, 41],
                outer: vec![22],
                params: vec![Bytes::from_static(b"dt"), Bytes::new()],
                parent: crate::ids::ROOT_JOB_ID,
            }),
            ControllerCommand::Terminate(Terminate { exit_status: 0 }),
        ]
    }

    fn worker_commands() -> Vec<WorkerCommand> {
        let tag = Some(TemplateTag {
            name: "frame".into(),
            generation: 1,
        });
        vec![
            WorkerCommand::HandshakeAck(HandshakeAck { worker_id: 3 }),
            WorkerCommand::ComputeJob(ComputeJob {
                name: "advect".into(),
                job_id: 10,
                read: vec![100, 101],
                write: vec![101],
                before: set(&[8]),
                after: set(&[]),
                params: Bytes::from_static(b"\x07"),
                template: tag.clone(),
            }),
            WorkerCommand::LocalCopy(LocalCopy {
                job_id: 11,
                from: 100,
                to: 102,
                before: set(&[10]),
                after: set(&[12]),
                template: None,
            }),
            WorkerCommand::RemoteCopySend(RemoteCopySend {
                job_id: 13,
                receive_job_ids: vec![14, 15],
                from: 100,
                to_worker: 2,
                before: set(&[10]),
                after: set(&[]),
                template: tag.clone(),
            }),
            WorkerCommand::RemoteCopyReceive(RemoteCopyReceive {
                job_id: 14,
                to: 110,
                before: set(&[]),
                after: set(&[16]),
                template: tag.clone(),
            }),
            WorkerCommand::MegaRcr(MegaRcr {
                job_id: 17,
                receives: vec![(14, 110), (15, 110)],
                before: set(&[]),
                after: set(&[16, 18]),
                template: tag.clone(),
            }),
            WorkerCommand::CombineJob(CombineJob {
                job_id: 19,
                scratch: vec![110, 111],
                reduce: vec![112],
                before: set(&[17]),
                after: set(&[]),
                template: tag,
            }),
            WorkerCommand::CreateData(CreateData {
                name: "velocity-0".into(),
                ldo: 1,
                job_id: 20,
                before: set(&[]),
                after: set(&[10]),
                pdi: 100,
            }),
            WorkerCommand::SaveData(SaveData {
                job_id: 30,
                checkpoint: 1,
                from: 100,
                ldo: 1,
                version: 5,
                before: set(&[10]),
                after: set(&[]),
            }),
            WorkerCommand::LoadData(LoadData {
                job_id: 31,
                to: 120,
                handle: Bytes::from_static(b"snap-000042"),
                before: set(&[]),
                after: set(&[32]),
            }),
            WorkerCommand::FinalizeTemplate(FinalizeTemplate { name: "frame".into() }),
            WorkerCommand::InstantiateTemplate(InstantiateTemplate {
                name: "frame".into(),
                inner: vec![40, 41, 42],
                outer: vec![22],
                extra_dependency: set(&[23]),
                params: vec![Bytes::from_static(b"dt"), Bytes::new(), Bytes::new()],
                physical: vec![100, 101, 110],
                generation: 2,
            }),
            WorkerCommand::PrepareRewind(PrepareRewind {
                templates: vec!["frame".into()],
            }),
            WorkerCommand::JobDoneRelay(JobDoneRelay { job_id: 22 }),
            WorkerCommand::Terminate(Terminate { exit_status: 2 }),
        ]
    }

    #[test]
    fn controller_commands_round_trip() {
        for serializer in [Serializer::Postcard, Serializer::Cbor] {
            for command in controller_commands() {
                let frame = command.to_frame(serializer).unwrap();
                let back = ControllerCommand::from_frame(&frame, serializer).unwrap();
                assert_eq!(back, command);
            }
        }
    }

    #[test]
    fn worker_commands_round_trip() {
        for serializer in [Serializer::Postcard, Serializer::Cbor] {
            for command in worker_commands() {
                let frame = command.to_frame(serializer).unwrap();
                let back = WorkerCommand::from_frame(&frame, serializer).unwrap();
                assert_eq!(back, command);
            }
        }
    }

    #[test]
    fn data_messages_round_trip() {
        let message = DataMessage {
            generation: 4,
            receive_job_id: 14,
            to_physical_id: 110,
            data: Bytes::from_static(b"payload"),
        };
        let frame = message.to_frame(Serializer::Postcard).unwrap();
        assert_eq!(DataMessage::from_frame(&frame, Serializer::Postcard).unwrap(), message);
    }

    #[test]
    fn tags_are_unique_and_stable() {
        let mut seen = std::collections::BTreeSet::new();
        for command in controller_commands() {
            assert!(seen.insert(command.tag()), "duplicate tag {}", command.tag());
        }
        for command in worker_commands() {
            assert!(seen.insert(command.tag()), "duplicate tag {}", command.tag());
        }
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let frame = ControllerCommand::Terminate(Terminate { exit_status: 0 })
            .to_frame(Serializer::Postcard)
            .unwrap();
        assert!(ControllerCommand::from_frame(&frame[..3], Serializer::Postcard).is_err());
        assert!(
            ControllerCommand::from_frame(&frame[..frame.len() - 1], Serializer::Postcard).is_err()
        );
    }

    #[test]
    fn serialization_is_deterministic() {
        for command in worker_commands() {
            let a = command.to_frame(Serializer::Postcard).unwrap();
            let b = command.to_frame(Serializer::Postcard).unwrap();
            assert_eq!(a, b);
        }
    }
}
