// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Core identity types shared across the CRL updater.

pub mod types;
