// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod doorbell;
pub mod heap;
pub mod peer;
pub mod segment;
pub mod transport;
pub mod wire;

pub use self::{
    doorbell::Doorbell,
    heap::{
        BlobHeap,
        BlobHeader,
        BlobType,
        HeapStats,
        SharedBlobHeap,
    },
    peer::PeerEndpoint,
    segment::SharedSegment,
    transport::Transport,
    wire::{
        CommandPacket,
        ResponsePacket,
    },
};
