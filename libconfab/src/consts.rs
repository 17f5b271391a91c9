// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time;

pub const DEFAULT_HOST: &str = "localhost";

/// How long a request may evaluate when it does not carry its own
/// timeout field.
pub const DEFAULT_REQUEST_TIMEOUT: time::Duration = time::Duration::from_millis(60_000);

/// How long an idle evaluation worker sticks around before the pool
/// recycles it.
pub const WORKER_KEEP_ALIVE: time::Duration = time::Duration::from_secs(30);

/// How long the accept loop sleeps after an accept error before it
/// goes around again.
pub const ACCEPT_RETRY_DELAY: time::Duration = time::Duration::from_millis(100);

/// How long to wait for the ack server to acknowledge our bound port.
pub const ACK_TIMEOUT: time::Duration = time::Duration::from_secs(10);

/// The namespace sessions start out in.
pub const DEFAULT_NS: &str = "user";
