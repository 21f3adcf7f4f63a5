use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use log::warn;

use crate::bindings::ASSERT_COUNTERS;

const IDLE: u8 = 0;
const PENDING: u8 = 1;
const READY: u8 = 2;

/// Staging copy of the `_assert_counts` buffer.
pub struct AssertReadback {
    staging: wgpu::Buffer,
    state: Arc<AtomicU8>,
}

impl AssertReadback {
    pub fn new(device: &wgpu::Device) -> Self {
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Assert Staging Buffer"),
            size: (ASSERT_COUNTERS * 4) as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        Self {
            staging,
            state: Arc::new(AtomicU8::new(IDLE)),
        }
    }

    /// Copies the counters unless the previous copy is still mapped.
    pub fn record(&self, encoder: &mut wgpu::CommandEncoder, counts: &wgpu::Buffer) -> bool {
        if self.state.load(Ordering::Acquire) != IDLE {
            return false;
        }
        encoder.copy_buffer_to_buffer(counts, 0, &self.staging, 0, (ASSERT_COUNTERS * 4) as u64);
        true
    }

    pub fn map(&self) {
        if self
            .state
            .compare_exchange(IDLE, PENDING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let state = self.state.clone();
        self.staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| match result {
                Ok(()) => state.store(READY, Ordering::Release),
                Err(e) => {
                    warn!("assert readback failed: {}", e);
                    state.store(IDLE, Ordering::Release);
                }
            });
    }

    /// Messages for every assertion that failed in some thread.
    pub fn collect(&self, threads: u64) -> Option<Vec<String>> {
        if self.state.load(Ordering::Acquire) != READY {
            return None;
        }
        let counts: Vec<u32> = {
            let data = self.staging.slice(..).get_mapped_range();
            bytemuck::cast_slice(&data).to_vec()
        };
        self.staging.unmap();
        self.state.store(IDLE, Ordering::Release);
        Some(describe_failures(&counts, threads))
    }
}

pub fn describe_failures(counts: &[u32], threads: u64) -> Vec<String> {
    counts
        .iter()
        .enumerate()
        .filter(|(_, count)| **count > 0)
        .map(|(index, count)| {
            let percent = *count as f64 / threads.max(1) as f64 * 100.0;
            format!("assertion {} failed in {:.3}% of threads", index, percent)
        })
        .collect()
}
