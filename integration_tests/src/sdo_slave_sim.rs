//! A scripted SDO server standing in for a slave node
//!
//! Serves expedited and segmented transfers from an in-memory object store,
//! records every completed write in order, and can be told to abort or stay
//! silent on specific objects to exercise the client's error paths.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use canmaster_common::{
    sdo::{AbortCode, SdoRequest, SdoResponse},
    CanId, CanMessage,
};
use tokio::task::JoinHandle;

use crate::sim_bus::{SimBus, SimBusReceiver, SimBusSender};
use canmaster_common::traits::AsyncCanReceiver;

#[derive(Default)]
struct Shared {
    objects: Mutex<HashMap<(u16, u8), Vec<u8>>>,
    writes: Mutex<Vec<(u16, u8, Vec<u8>)>>,
    aborts: Mutex<HashMap<(u16, u8), AbortCode>>,
    drop_counts: Mutex<HashMap<(u16, u8), u32>>,
    initiate_counts: Mutex<HashMap<(u16, u8), u32>>,
}

struct UploadState {
    data: Vec<u8>,
    pos: usize,
    toggle: bool,
}

struct DownloadState {
    index: u16,
    sub: u8,
    buf: Vec<u8>,
    toggle: bool,
}

/// A simulated SDO server for one node ID
pub struct SdoSlaveSim {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl SdoSlaveSim {
    /// Attach a simulated server for `node_id` to the bus
    pub fn spawn(bus: &SimBus, node_id: u8) -> Self {
        let (sender, receiver) = bus.endpoint();
        let shared = Arc::new(Shared::default());
        let task = tokio::spawn(server_loop(node_id, sender, receiver, shared.clone()));
        Self { shared, task }
    }

    /// Seed or overwrite an object in the store
    pub fn set_object(&self, index: u16, sub: u8, data: &[u8]) {
        self.shared
            .objects
            .lock()
            .unwrap()
            .insert((index, sub), data.to_vec());
    }

    /// Current content of an object, including completed client writes
    pub fn object(&self, index: u16, sub: u8) -> Option<Vec<u8>> {
        self.shared.objects.lock().unwrap().get(&(index, sub)).cloned()
    }

    /// Respond to any transfer of the object with the given abort code
    pub fn set_abort(&self, index: u16, sub: u8, code: AbortCode) {
        self.shared.aborts.lock().unwrap().insert((index, sub), code);
    }

    /// Stay silent for the next `count` initiate requests on the object
    pub fn drop_requests(&self, index: u16, sub: u8, count: u32) {
        self.shared
            .drop_counts
            .lock()
            .unwrap()
            .insert((index, sub), count);
    }

    /// Every completed write, in arrival order
    pub fn recorded_writes(&self) -> Vec<(u16, u8, Vec<u8>)> {
        self.shared.writes.lock().unwrap().clone()
    }

    /// How many transfers the client initiated on the object
    pub fn initiate_count(&self, index: u16, sub: u8) -> u32 {
        self.shared
            .initiate_counts
            .lock()
            .unwrap()
            .get(&(index, sub))
            .copied()
            .unwrap_or(0)
    }
}

impl Drop for SdoSlaveSim {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn server_loop(
    node_id: u8,
    sender: SimBusSender,
    mut receiver: SimBusReceiver,
    shared: Arc<Shared>,
) {
    let req_id = CanId::std(0x600 + node_id as u16);
    let resp_id = CanId::std(0x580 + node_id as u16);
    let mut upload: Option<UploadState> = None;
    let mut download: Option<DownloadState> = None;

    let respond = |resp: SdoResponse| {
        sender.send_now(CanMessage::new(resp_id, &resp.to_bytes()));
    };

    while let Ok(msg) = receiver.recv().await {
        if msg.is_rtr() || msg.id() != req_id {
            continue;
        }
        let Ok(request) = SdoRequest::try_from(msg.data()) else {
            continue;
        };
        match request {
            SdoRequest::InitiateUpload { index, sub } => {
                let key = (index, sub);
                *shared.initiate_counts.lock().unwrap().entry(key).or_insert(0) += 1;
                if shared.should_drop(key) {
                    continue;
                }
                if let Some(code) = shared.aborts.lock().unwrap().get(&key) {
                    respond(SdoResponse::abort(index, sub, *code));
                    continue;
                }
                let data = shared.objects.lock().unwrap().get(&key).cloned();
                match data {
                    None => respond(SdoResponse::abort(index, sub, AbortCode::NoSuchObject)),
                    Some(data) if data.len() <= 4 => {
                        respond(SdoResponse::expedited_upload(index, sub, &data))
                    }
                    Some(data) => {
                        respond(SdoResponse::segmented_upload(index, sub, data.len() as u32));
                        upload = Some(UploadState {
                            data,
                            pos: 0,
                            toggle: false,
                        });
                    }
                }
            }
            SdoRequest::UploadSegment { t } => {
                let Some(state) = upload.as_mut() else {
                    respond(SdoResponse::abort(0, 0, AbortCode::InvalidCommandSpecifier));
                    continue;
                };
                if t != state.toggle {
                    respond(SdoResponse::abort(0, 0, AbortCode::ToggleNotAlternated));
                    upload = None;
                    continue;
                }
                let chunk_len = (state.data.len() - state.pos).min(7);
                let chunk = state.data[state.pos..state.pos + chunk_len].to_vec();
                state.pos += chunk_len;
                let last = state.pos >= state.data.len();
                respond(SdoResponse::upload_segment(t, last, &chunk));
                state.toggle = !state.toggle;
                if last {
                    upload = None;
                }
            }
            SdoRequest::ExpeditedDownload {
                index,
                sub,
                len,
                data,
            } => {
                let key = (index, sub);
                *shared.initiate_counts.lock().unwrap().entry(key).or_insert(0) += 1;
                if shared.should_drop(key) {
                    continue;
                }
                if let Some(code) = shared.aborts.lock().unwrap().get(&key) {
                    respond(SdoResponse::abort(index, sub, *code));
                    continue;
                }
                let bytes = data[..len as usize].to_vec();
                shared.objects.lock().unwrap().insert(key, bytes.clone());
                shared.writes.lock().unwrap().push((index, sub, bytes));
                respond(SdoResponse::confirm_download(index, sub));
            }
            SdoRequest::InitiateDownload { index, sub, size } => {
                let key = (index, sub);
                *shared.initiate_counts.lock().unwrap().entry(key).or_insert(0) += 1;
                if shared.should_drop(key) {
                    continue;
                }
                if let Some(code) = shared.aborts.lock().unwrap().get(&key) {
                    respond(SdoResponse::abort(index, sub, *code));
                    continue;
                }
                download = Some(DownloadState {
                    index,
                    sub,
                    buf: Vec::with_capacity(size as usize),
                    toggle: false,
                });
                respond(SdoResponse::confirm_download(index, sub));
            }
            SdoRequest::DownloadSegment { t, c, len, data } => {
                let Some(state) = download.as_mut() else {
                    respond(SdoResponse::abort(0, 0, AbortCode::InvalidCommandSpecifier));
                    continue;
                };
                if t != state.toggle {
                    respond(SdoResponse::abort(
                        state.index,
                        state.sub,
                        AbortCode::ToggleNotAlternated,
                    ));
                    download = None;
                    continue;
                }
                state.buf.extend_from_slice(&data[..len as usize]);
                respond(SdoResponse::ConfirmDownloadSegment { t });
                state.toggle = !state.toggle;
                if c {
                    let state = download.take().unwrap();
                    shared
                        .objects
                        .lock()
                        .unwrap()
                        .insert((state.index, state.sub), state.buf.clone());
                    shared
                        .writes
                        .lock()
                        .unwrap()
                        .push((state.index, state.sub, state.buf));
                }
            }
            SdoRequest::Abort { .. } => {
                upload = None;
                download = None;
            }
        }
    }
}

impl Shared {
    fn should_drop(&self, key: (u16, u8)) -> bool {
        let mut drops = self.drop_counts.lock().unwrap();
        match drops.get_mut(&key) {
            Some(count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        }
    }
}
