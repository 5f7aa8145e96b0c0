//! Core utilities: calendar math for the 13-week horizon

pub mod calendar;
