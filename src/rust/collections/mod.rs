// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod raw_region;
pub mod ring;
