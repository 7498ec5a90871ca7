// Copyright 2022 SphereEx Authors
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

//! MySQL/MariaDB wire protocol engine for the gateway. Frames packets on
//! both sides of the proxy, drives backend authentication, tracks the reply
//! state of every in-flight command and extracts session state from OK
//! packets.

pub mod backend;
pub mod err;
pub mod mysql_const;
pub mod packet;
pub mod proxy_header;
pub mod session;
pub mod util;
