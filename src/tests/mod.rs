//! Cross-module test suites
//!
//! Each suite drives full engines against one shared in-process backend,
//! one engine (and one local store) per simulated device.

mod contact_tests;
mod group_tests;
mod presence_tests;

use crate::presence::StatusKv;
use crate::remote::RemoteStore;
use crate::store::LocalStore;
use crate::sync::SyncEngine;
use std::sync::Arc;
use std::time::Duration;

/// One shared backend: document store plus presence node
pub(crate) fn backend() -> (Arc<RemoteStore>, Arc<StatusKv>) {
    let remote = Arc::new(RemoteStore::new());
    let status = Arc::new(StatusKv::new(remote.clock()));
    (remote, status)
}

/// An engine for `uid` with its own in-memory local store
pub(crate) fn engine(
    remote: &Arc<RemoteStore>,
    status: &Arc<StatusKv>,
    uid: &str,
) -> Arc<SyncEngine> {
    let local = Arc::new(LocalStore::open_in_memory().unwrap());
    Arc::new(SyncEngine::new(local, Arc::clone(remote), Arc::clone(status), uid).unwrap())
}

/// Wait until `check` passes, polling between task wakeups
pub(crate) async fn wait_for<F: Fn() -> bool>(check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within timeout");
}
