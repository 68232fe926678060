#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use std::sync::Arc;
use std::time::Instant;
use synclink::config::NetworkConfig;
use synclink::core::packet::{Frame, PacketFlags, PacketKind};
use synclink::protocol::auth::NoAuthentication;
use synclink::protocol::dispatcher::PacketRegistry;
use synclink::protocol::session::{Session, SessionSettings, Side};

fuzz_target!(|data: &[u8]| {
    // First byte picks the packet kind, second the flags, the rest is the body
    let [kind, flags, body @ ..] = data else {
        return;
    };
    let (Ok(kind), Ok(flags)) = (PacketKind::from_u8(*kind), PacketFlags::from_bits(*flags)) else {
        return;
    };
    let Ok(frame) = Frame::new(kind, flags, Bytes::copy_from_slice(body)) else {
        return;
    };

    let settings = Arc::new(SessionSettings::from_config(
        Side::Server,
        &NetworkConfig::default(),
        Arc::new(NoAuthentication),
        Arc::new(PacketRegistry::new()),
    ));
    let mut session = Session::server(settings, 1, "fuzz", Instant::now());
    let _ = session.receive(frame, Instant::now());
});
