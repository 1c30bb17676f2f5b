use std::fs::File;
use std::path::Path;

use anyhow::Result;
use csv::Writer;
use log::info;
use serde::{Deserialize, Serialize};

use crate::circuit::Signal;
use crate::simulator::SignalSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Csv,
    Json,
}

/// One recorded signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    pub signal: Signal,
    pub samples: Vec<f64>,
}

/// Collects every stream handed to it by a processor, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub sample_rate: f64,
    pub channels: Vec<Channel>,
}

impl Recording {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self, signal: &Signal) -> Option<&[f64]> {
        self.channels
            .iter()
            .find(|c| c.signal == *signal)
            .map(|c| c.samples.as_slice())
    }

    /// Longest channel length in samples.
    pub fn len(&self) -> usize {
        self.channels.iter().map(|c| c.samples.len()).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn export(&self, path: &Path, format: OutputFormat) -> Result<()> {
        match format {
            OutputFormat::Csv => self.export_csv(path),
            OutputFormat::Json => self.export_json(path),
        }
    }

    /// One row per sample; channels that started late are left blank.
    pub fn export_csv(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = Writer::from_writer(file);

        let mut header = vec!["time".to_string()];
        header.extend(self.channels.iter().map(|c| c.name.clone()));
        writer.write_record(&header)?;

        let rows = self.len();
        for i in 0..rows {
            let mut record = Vec::with_capacity(self.channels.len() + 1);
            record.push(self.time(i).to_string());
            for channel in &self.channels {
                // Late channels are aligned to the end of the recording.
                let offset = rows - channel.samples.len();
                let value = i
                    .checked_sub(offset)
                    .and_then(|j| channel.samples.get(j))
                    .map(f64::to_string)
                    .unwrap_or_default();
                record.push(value);
            }
            writer.write_record(&record)?;
        }

        writer.flush()?;
        info!("Results exported to CSV: {}", path.display());
        Ok(())
    }

    pub fn export_json(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;

        info!("Results exported to JSON: {}", path.display());
        Ok(())
    }

    fn time(&self, index: usize) -> f64 {
        if self.sample_rate > 0.0 {
            index as f64 / self.sample_rate
        } else {
            0.0
        }
    }

    pub fn print_summary(&self) {
        println!("\n=== Simulation Summary ===");
        println!("Sample rate: {:.1} Hz", self.sample_rate);
        println!("Recorded samples: {}", self.len());
        println!("Duration: {:.3}ms", self.time(self.len()) * 1000.0);

        if self.channels.is_empty() {
            return;
        }
        println!("\nSignals (final value, peak):");
        for channel in &self.channels {
            let peak = channel.samples.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
            if let Some(last) = channel.samples.last() {
                println!("  {}: {:.6}, {:.6}", channel.name, last, peak);
            }
        }
    }
}

impl SignalSink for Recording {
    fn signal(&mut self, signal: &Signal, samples: &[f64], sample_rate: f64) {
        self.sample_rate = sample_rate;
        match self.channels.iter_mut().find(|c| c.signal == *signal) {
            Some(channel) => channel.samples.extend_from_slice(samples),
            None => self.channels.push(Channel {
                name: signal.to_string(),
                signal: signal.clone(),
                samples: samples.to_vec(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn recording() -> Recording {
        let mut recording = Recording::new();
        recording.signal(&Signal::voltage("out"), &[0.0, 0.5], 1000.0);
        recording.signal(&Signal::voltage("out"), &[1.0], 1000.0);
        recording.signal(&Signal::current("R1"), &[2e-3], 1000.0);
        recording
    }

    #[test]
    fn test_sink_appends_per_signal() {
        let recording = recording();
        assert_eq!(recording.channels.len(), 2);
        assert_eq!(recording.channel(&Signal::voltage("out")), Some(&[0.0, 0.5, 1.0][..]));
        assert_eq!(recording.len(), 3);
        assert!(recording.channel(&Signal::voltage("in")).is_none());
    }

    #[test]
    fn test_export_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");
        recording().export(&path, OutputFormat::Csv).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "time,V(out),I(R1)");
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], "0,0,");
        assert_eq!(lines[3], "0.002,1,0.002");
    }

    #[test]
    fn test_export_json_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.json");
        let original = recording();
        original.export(&path, OutputFormat::Json).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let loaded: Recording = serde_json::from_str(&text).unwrap();
        assert_eq!(loaded, original);
    }
}
