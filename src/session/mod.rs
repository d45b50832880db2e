pub mod media;
mod manager;
mod webrtc_utils;

pub use manager::{
    ConnectionStats, PeerRole, PeerSessionManager, SessionEvent, INSTRUCTOR_PEER_ID,
};
pub use webrtc_utils::{create_webrtc_api, get_ice_servers, IceConfig};
