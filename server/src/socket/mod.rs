mod auth;
mod events;
pub mod rooms;
pub mod types;

use std::sync::Arc;

use socketioxide::{SocketIo, layer::SocketIoLayer};

use crate::state::AppState;

const MAX_PAYLOAD_BYTES: u64 = 1_000_000;
const MAX_BUFFER_SIZE: usize = 4096;

pub(crate) fn build_socket_layer(state: AppState) -> (SocketIoLayer, Arc<SocketIo>) {
    let shared = Arc::new(state);
    let (layer, io) = SocketIo::builder()
        .max_payload(MAX_PAYLOAD_BYTES)
        .max_buffer_size(MAX_BUFFER_SIZE)
        .build_layer();
    events::register_namespace(&io, shared);
    (layer, Arc::new(io))
}
