// Copyright 2025 Firegate Authors
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

pub mod channel;
pub mod http;
pub mod pool;
pub mod rpc;
pub mod stream;

pub use channel::{CallOptions, Channel, InboundStream, RawStream, RequestSink};
pub use http::{HttpChannel, HttpChannelConfig};
pub use pool::{ClientPool, PoolConfig};
pub use rpc::{
    is_bidirectional, RpcConfig, RpcFacade, StreamRetryConfig, BIDIRECTIONAL_METHODS,
    RESOURCE_PREFIX_HEADER, ROUTING_HEADER,
};
pub use stream::{DuplexStream, HandshakeState, ResponseStream};
