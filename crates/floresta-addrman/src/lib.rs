// SPDX-License-Identifier: MIT

//! A bucketed address manager for bitcoin peers.
//!
//! Addresses we hear about go into the "new" table, addresses we managed to connect to go
//! into the "tried" table. Both are split into fixed-size buckets, and where an address
//! lands depends on a secret key and on the address' network group. An attacker can't
//! predict placement, and can't fill our tables from a single IP range either, so eclipsing
//! a node through its address manager gets really expensive.
//!
//! The main type is [`AddrMan`]. It's thread safe, and meant to be shared between the tasks
//! that learn about addresses and the ones opening connections:
//!
//! ```no_run
//! use floresta_addrman::AddrMan;
//! use floresta_addrman::AddrManConfig;
//! use floresta_addrman::PeerAddress;
//!
//! let addrman = AddrMan::new(&AddrManConfig::default(), None);
//! let address: PeerAddress = "1.2.3.4:8333".parse().unwrap();
//!
//! addrman.add(&[address], "5.6.7.8".parse().unwrap());
//! if let Some(info) = addrman.select(false) {
//!     // try connecting to info.addr
//!     addrman.attempt(&info.addr, true);
//! }
//! ```
//!
//! The whole table can be persisted with the bitcoin consensus encoding, see
//! [`serialization`].

// cargo docs customization
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc(html_logo_url = "https://avatars.githubusercontent.com/u/249173822")]
#![doc(
    html_favicon_url = "https://raw.githubusercontent.com/getfloresta/floresta-media/master/logo_png/Icon-Green(main).png"
)]

mod macros;

pub mod addr_info;
pub mod bucket;
pub mod collision;
pub mod config;
pub mod error;
pub mod manager;
pub mod netgroup;
pub mod serialization;
pub mod time;

pub use addr_info::AddrInfo;
pub use addr_info::PeerAddress;
pub use collision::CollisionResolution;
pub use collision::ConnectivityProbe;
pub use collision::ProbeError;
pub use collision::TcpConnectProbe;
pub use config::AddrManConfig;
pub use error::AddrManError;
pub use manager::AddrMan;
pub use netgroup::AsMap;
pub use netgroup::NetGroupManager;
pub use time::Clock;
pub use time::ManualClock;
pub use time::SystemClock;
