/*
 * Copyright 2026 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Re-running a connection with a backoff delay between attempts.

use std::time::Duration;

use crate::error::Error;

use super::{Connection, Endpoint, Timeouts};

/// How long to wait between connection attempts.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    /// Delay after the first failure.
    pub initial: Duration,
    /// Upper bound on the delay; each failure doubles it up to here.
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

/// Runs `connection` against `endpoint` over and over, sleeping between
/// attempts, until a run is deliberately cancelled.  Requests configured
/// with `retry_on_disconnect`, and requests not yet written, survive from
/// one run into the next.
///
/// Returns the error of the final, cancelled run.
pub async fn run_with_backoff(
    connection: &Connection,
    endpoint: &Endpoint,
    timeouts: &Timeouts,
    backoff: Backoff,
) -> Error {
    let mut delay = backoff.initial;
    loop {
        let started = std::time::Instant::now();
        let err = match connection.run(endpoint, timeouts).await {
            Err(err) => err,
            Ok(()) => Error::ConnectionLost,
        };
        if matches!(err, Error::Aborted) {
            return err;
        }

        // A run that stayed up for a while was a healthy connection; start
        // the backoff over rather than compounding earlier failures.
        if started.elapsed() >= backoff.max {
            delay = backoff.initial;
        }
        log::warn!(
            "connection to {}:{} ended: {}; retrying in {:?}",
            endpoint.host,
            endpoint.port,
            err,
            delay
        );
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(backoff.max);
    }
}
