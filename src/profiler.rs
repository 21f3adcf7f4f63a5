use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};

use crate::error::{ProfilerError, ResourceError};

/// One compute pass of one entry point, as recorded by the engine.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PassDescriptor {
    pub label: String,
    /// Begin and end query indices, when profiling.
    pub timestamps: Option<[u32; 2]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapState {
    Idle,
    Pending,
    Ready,
}

/// GPU timestamp queries for every dispatch of a compiled program.
pub struct Profiler {
    query_set: wgpu::QuerySet,
    resolve_buffer: wgpu::Buffer,
    result_buffer: wgpu::Buffer,
    /// (entry point, passes per frame)
    entries: Vec<(String, u32)>,
    query_count: u32,
    period_ns: f64,
    state: Arc<Mutex<MapState>>,
}

impl Profiler {
    pub fn new(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        entries: &[(String, u32)],
    ) -> Result<Self, ResourceError> {
        if !device.features().contains(wgpu::Features::TIMESTAMP_QUERY) {
            return Err(ResourceError::TimestampsUnsupported);
        }
        let total: u32 = entries.iter().map(|(_, passes)| (*passes).max(1)).sum();
        let query_count = (total * 2).clamp(2, wgpu::QUERY_SET_MAX_QUERIES);
        if total * 2 > query_count {
            warn!("only the first {} dispatches will be timed", query_count / 2);
        }
        let query_set = device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some("Profiler Query Set"),
            ty: wgpu::QueryType::Timestamp,
            count: query_count,
        });
        // Each timestamp is a u64
        let size = query_count as u64 * 8;
        let resolve_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Profiler Resolve Buffer"),
            size,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let result_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Profiler Result Buffer"),
            size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let period_ns = queue.get_timestamp_period() as f64;
        info!(
            "profiling {} dispatches at {} ns/tick",
            total, period_ns
        );
        Ok(Self {
            query_set,
            resolve_buffer,
            result_buffer,
            entries: entries
                .iter()
                .map(|(name, passes)| (name.clone(), (*passes).max(1)))
                .collect(),
            query_count,
            period_ns,
            state: Arc::new(Mutex::new(MapState::Idle)),
        })
    }

    pub fn query_set(&self) -> &wgpu::QuerySet {
        &self.query_set
    }

    /// Assigns a disjoint begin/end pair to each pass, in order.
    pub fn fill_pass_descriptors<'a>(
        &self,
        passes: impl IntoIterator<Item = &'a mut PassDescriptor>,
    ) {
        for (index, pass) in passes.into_iter().enumerate() {
            let begin = index as u32 * 2;
            pass.timestamps = (begin + 1 < self.query_count).then_some([begin, begin + 1]);
        }
    }

    fn state(&self) -> MapState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(MapState::Pending)
    }

    /// Resolves this frame's queries unless the result buffer is still mapped.
    ///
    /// Returns whether anything was recorded; only then should
    /// [`after_finish`](Self::after_finish) follow the submit.
    pub fn before_finish(&self, encoder: &mut wgpu::CommandEncoder) -> bool {
        if self.state() != MapState::Idle {
            return false;
        }
        encoder.resolve_query_set(&self.query_set, 0..self.query_count, &self.resolve_buffer, 0);
        encoder.copy_buffer_to_buffer(
            &self.resolve_buffer,
            0,
            &self.result_buffer,
            0,
            self.query_count as u64 * 8,
        );
        true
    }

    /// Starts mapping the result buffer after the frame has been submitted.
    pub fn after_finish(&self) -> Result<(), ProfilerError> {
        {
            let mut state = self.state.lock().map_err(|_| ProfilerError::MapInFlight)?;
            if *state != MapState::Idle {
                return Err(ProfilerError::MapInFlight);
            }
            *state = MapState::Pending;
        }
        let state = self.state.clone();
        self.result_buffer
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                if let Ok(mut state) = state.lock() {
                    *state = match result {
                        Ok(()) => MapState::Ready,
                        Err(e) => {
                            warn!("profiler readback failed: {}", e);
                            MapState::Idle
                        }
                    };
                }
            });
        Ok(())
    }

    /// Per-entry GPU time summed over its passes, once a readback has landed.
    pub fn collect(&self) -> Option<Vec<(String, Duration)>> {
        if self.state() != MapState::Ready {
            return None;
        }
        let timings = {
            let data = self.result_buffer.slice(..).get_mapped_range();
            let timestamps: &[u64] = bytemuck::cast_slice(&data);
            let mut pass = 0usize;
            self.entries
                .iter()
                .map(|(name, passes)| {
                    let mut ticks = 0u64;
                    for _ in 0..*passes {
                        if let (Some(begin), Some(end)) =
                            (timestamps.get(pass * 2), timestamps.get(pass * 2 + 1))
                        {
                            ticks += end.saturating_sub(*begin);
                        }
                        pass += 1;
                    }
                    let nanos = (ticks as f64 * self.period_ns) as u64;
                    (name.clone(), Duration::from_nanos(nanos))
                })
                .collect()
        };
        self.result_buffer.unmap();
        if let Ok(mut state) = self.state.lock() {
            *state = MapState::Idle;
        }
        Some(timings)
    }

    pub fn dispose(self) {
        if self.state() == MapState::Pending {
            warn!("disposing profiler with a readback in flight");
        }
        self.resolve_buffer.destroy();
        self.result_buffer.destroy();
    }
}

/// `(entry point, "0.123ms")` pairs.
pub fn format_timings(timings: &[(String, Duration)]) -> Vec<(String, String)> {
    timings
        .iter()
        .map(|(name, duration)| {
            (name.clone(), format!("{:.3}ms", duration.as_secs_f64() * 1000.0))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timings_are_formatted_in_milliseconds() {
        let lines = format_timings(&[
            ("main".into(), Duration::from_micros(1500)),
            ("blur".into(), Duration::from_nanos(250)),
        ]);
        assert_eq!(lines[0], ("main".to_string(), "1.500ms".to_string()));
        assert_eq!(lines[1].1, "0.000ms");
    }

    #[test]
    fn profiler_requires_timestamp_support() {
        let Some(gpu) = crate::gpu::test_gpu() else {
            return;
        };
        let entries = vec![("main".to_string(), 3), ("once".to_string(), 0)];
        let profiler = match Profiler::new(&gpu.device, &gpu.queue, &entries) {
            Ok(profiler) => profiler,
            Err(ResourceError::TimestampsUnsupported) => return,
            Err(e) => panic!("{e}"),
        };

        let mut passes = vec![PassDescriptor::default(); 4];
        profiler.fill_pass_descriptors(passes.iter_mut());
        let indices: Vec<_> = passes.iter().map(|p| p.timestamps.unwrap()).collect();
        assert_eq!(indices, vec![[0, 1], [2, 3], [4, 5], [6, 7]]);

        let mut encoder = gpu.device.create_command_encoder(&Default::default());
        assert!(profiler.before_finish(&mut encoder));
        gpu.queue.submit(Some(encoder.finish()));
        profiler.after_finish().unwrap();
        assert_eq!(profiler.after_finish(), Err(ProfilerError::MapInFlight));

        let mut encoder = gpu.device.create_command_encoder(&Default::default());
        assert!(!profiler.before_finish(&mut encoder));
        profiler.dispose();
    }
}
