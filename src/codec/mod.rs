// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Wire formats: the tagged varuint `WireCodec` used between bridges, and the RFC 6455
//! `WsCodec` used to carry it (or raw HTTP) over a byte stream.

pub mod wire;
pub mod ws;
