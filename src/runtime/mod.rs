// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod fail;
pub mod logging;
pub mod memory;
pub mod sleep;
pub mod waiter;
