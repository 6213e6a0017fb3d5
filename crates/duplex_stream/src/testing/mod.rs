// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Test doubles for exercising stream logic without sockets or an event loop.
//!
//! [`ManualNotifier`] records readiness registrations and lets the test decide when they fire.
//! [`FakeTransport`] replays a script of read and write results. [`drive()`] runs a future to
//! completion by alternating polls with firing every armed registration.

mod drive;
mod fake_transport;
mod manual_notifier;

pub use drive::*;
pub use fake_transport::*;
pub use manual_notifier::*;
