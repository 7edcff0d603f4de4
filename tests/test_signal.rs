// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use rkstream::pipeline::stop_on_signal;
use std::{
    sync::atomic::Ordering,
    thread::sleep,
    time::{Duration, Instant},
};

#[test]
fn test_sigterm_stops() {
    let stop = stop_on_signal();
    assert!(!stop.load(Ordering::SeqCst));

    assert_eq!(unsafe { libc::raise(libc::SIGTERM) }, 0);
    let start = Instant::now();
    while !stop.load(Ordering::SeqCst) {
        assert!(
            start.elapsed() < Duration::from_secs(2),
            "SIGTERM did not raise the stop flag"
        );
        sleep(Duration::from_millis(5));
    }

    // A second handler cannot be installed; its flag stays down.
    let again = stop_on_signal();
    assert!(!again.load(Ordering::SeqCst));
}
