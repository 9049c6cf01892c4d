// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Link-layer endpoints. The stack reads raw IP frames from a link endpoint
//! and emits raw IP frames back; the TUN syscall plumbing itself lives in
//! the embedding program.

pub mod channel;
