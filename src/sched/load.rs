// src/sched/load.rs

use std::fs;
use std::io;

/// Source of the system's 1-minute load average.
pub trait LoadSource {
    fn load_average(&self) -> io::Result<f64>;
}

/// Reads `/proc/loadavg`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLoad;

impl LoadSource for SystemLoad {
    fn load_average(&self) -> io::Result<f64> {
        let contents = fs::read_to_string("/proc/loadavg")?;
        parse_loadavg(&contents)
    }
}

/// Parse the first field of a `/proc/loadavg` line.
pub fn parse_loadavg(contents: &str) -> io::Result<f64> {
    contents
        .split_whitespace()
        .next()
        .and_then(|field| field.parse::<f64>().ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unrecognised load average: {:?}", contents.trim()),
            )
        })
}
