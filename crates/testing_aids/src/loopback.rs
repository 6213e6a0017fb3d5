// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};

/// Starts a blocking loopback peer that accepts exactly one connection and hands it to `peer`
/// on a background thread.
///
/// Returns the address to connect to and the handle of the peer thread. Joining the handle
/// re-raises any assertion failure of the peer.
///
/// # Panics
///
/// Panics if the loopback listener cannot be bound.
#[cfg_attr(test, mutants::skip)] // This is test logic - pointless to mutate.
pub fn loopback_peer<F>(peer: F) -> (SocketAddr, JoinHandle<()>)
where
    F: FnOnce(TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = thread::Builder::new()
        .name("loopback peer".to_string())
        .spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            peer(stream);
        })
        .unwrap();

    (addr, handle)
}
