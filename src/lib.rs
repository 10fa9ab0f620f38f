mod connection;
pub mod packet;
mod rtmp;
pub mod service;

pub mod codec;
pub mod config;
pub mod cpu;
pub mod error;
pub mod errors;
pub mod fuse;
pub mod handler;
#[cfg(feature = "http-health")]
pub mod health;
pub mod info;
pub mod ingress;
pub mod manager;
pub mod metrics;
pub mod monitor;
pub mod pipeline;
pub mod recorder;
pub mod registry;
pub mod transport;

type StreamKey = String;

use std::{fs, io, path::Path};

pub use self::{
    connection::ConnectionContext,
    handler::{Handler, IngressRpc},
    manager::{handle_whip_publish, Manager, RpcServer},
    monitor::Monitor,
    transport::{ManagerHandle, ManagerMessage},
};

const FLV_HEADER: [u8; 13] = [
    0x46, 0x4c, 0x56, 0x01, 0x05, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00,
];

fn put_i24_be(b: &mut [u8], v: i32) {
    b[0] = (v >> 16) as u8;
    b[1] = (v >> 8) as u8;
    b[2] = v as u8;
}

fn put_i32_be(b: &mut [u8], v: i32) {
    b[0] = (v >> 24) as u8;
    b[1] = (v >> 16) as u8;
    b[2] = (v >> 8) as u8;
    b[3] = v as u8;
}

fn prepare_stream_directory<P: AsRef<Path>>(path: P) -> io::Result<()> {
    let stream_path = path.as_ref();
    if stream_path.exists() && !stream_path.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!(
                "Path '{}' exists, but is not a directory",
                stream_path.display()
            ),
        ));
    }
    log::debug!("Creating recording directory at '{}'", stream_path.display());
    fs::create_dir_all(stream_path)
}
