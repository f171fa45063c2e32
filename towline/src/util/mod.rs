// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

pub mod buffer_pool;
pub mod cancellation;
pub mod framed;
pub mod timed;
