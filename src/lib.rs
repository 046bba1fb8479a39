// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Privilege-separated fan control for Clevo laptops.
//!
//! The embedded controller behind two legacy I/O ports owns the fans.
//! Root is required to reach it, while the status panel should run as the
//! desktop user, so one process forks in two: a privileged control worker
//! that speaks to the EC, and an unprivileged panel that renders readings
//! and posts intents through a page of shared memory.
//!
//! [`curve`] decides duties, [`ec`] speaks the register protocol,
//! [`shared`] carries state between the processes, [`worker`] runs the
//! control loop, [`supervisor`] wires the processes together and [`ui`]
//! draws the panel.

pub mod config;
pub mod curve;
pub mod ec;
pub mod shared;
pub mod supervisor;
pub mod ui;
pub mod worker;
