use crate::actor::{ActorClient, DeviceActor};
use crate::api::client::DeviceHandle;
use crate::api::options::{MirrorOptions, MirrorOptionsValidated};
use crate::api::types::ConnState;
use crate::blockdev::BlockTarget;
use crate::device::{Bitmap, Counters, Device, DeviceSeed, Metadata, MetadataStore, TransferLog};
use crate::workers::WorkerSet;
use std::convert::TryFrom;
use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};
use tokio::sync::{watch, Mutex};

pub struct DeviceConfig {
    pub logger: slog::Logger,
    pub target: Arc<dyn BlockTarget>,
    pub meta_store: Box<dyn MetadataStore>,
    pub options: MirrorOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceCreationError {
    #[error("illegal options for configuring device: {0}")]
    IllegalOptions(String),
    #[error("metadata initialisation failure")]
    Metadata(#[from] io::Error),
    #[error("backing device reports zero capacity")]
    ZeroCapacity,
}

/// Assemble a device and spawn its actor. Must run inside a tokio runtime.
/// The returned handle starts StandAlone as Secondary; attach a transport
/// and set a role to put it to work.
pub fn try_create_device(config: DeviceConfig) -> Result<DeviceHandle, DeviceCreationError> {
    let root_logger = config.logger;

    let opts = Arc::new(
        MirrorOptionsValidated::try_from(config.options)
            .map_err(|e| DeviceCreationError::IllegalOptions(e.to_string()))?,
    );

    let capacity = config.target.capacity();
    if capacity == 0 {
        return Err(DeviceCreationError::ZeroCapacity);
    }

    let meta = Metadata::read(
        root_logger.new(slog::o!("part" => "metadata")),
        config.meta_store,
        false,
    )?;
    let bitmap = Arc::new(Bitmap::new(
        root_logger.new(slog::o!("part" => "bitmap")),
        capacity,
    ));
    let tl = Arc::new(RwLock::new(TransferLog::new(
        root_logger.new(slog::o!("part" => "transfer_log")),
        opts.tl_size,
    )));
    let counters = Arc::new(Counters::default());
    let issue_barrier = Arc::new(AtomicBool::new(false));
    let (cstate_tx, cstate_rx) = watch::channel(ConnState::StandAlone);

    let (actor_client, actor_queue_rx) = ActorClient::new();

    let device = Device::new(DeviceSeed {
        logger: root_logger.clone(),
        opts: opts.clone(),
        target: config.target.clone(),
        meta,
        bitmap: bitmap.clone(),
        tl: tl.clone(),
        counters: counters.clone(),
        issue_barrier: issue_barrier.clone(),
        actor: actor_client.weak(),
        cstate_tx,
    });

    let device_actor = DeviceActor::new(root_logger.clone(), actor_queue_rx, device);
    tokio::spawn(device_actor.run_event_loop());

    Ok(DeviceHandle {
        logger: root_logger,
        actor: actor_client,
        opts,
        target: config.target,
        counters,
        bitmap,
        tl,
        issue_barrier,
        cstate_rx,
        workers: Mutex::new(WorkerSet::new()),
    })
}
