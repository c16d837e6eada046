//! Processing chain: an ordered list of stages driven with a pull-then-push loop.
//!
//! Stages are held as a tagged list. The sink reaches the stages it needs to steer
//! (trimming, silence skipping, speed) through typed accessors; everything else is
//! driven uniformly through [`AudioProcessor`].

use crate::buffer::AudioBuf;
use crate::config::SinkConfig;
use crate::error::UnhandledFormat;
use crate::format::PcmSpec;
use crate::processor::{
    AudioProcessor, ChannelMapping, Resampling, SilenceSkipping, SilenceSkippingConfig,
    SpeedChange, ToFloatPcm, ToInt16Pcm, Trimming,
};

/// One slot in the chain.
pub enum Stage {
    ToInt16(ToInt16Pcm),
    ToFloat(ToFloatPcm),
    ChannelMapping(ChannelMapping),
    Trimming(Trimming),
    SilenceSkipping(SilenceSkipping),
    Speed(SpeedChange),
    Resampling(Resampling),
    Custom(Box<dyn AudioProcessor>),
}

impl Stage {
    fn processor(&self) -> &dyn AudioProcessor {
        match self {
            Stage::ToInt16(p) => p,
            Stage::ToFloat(p) => p,
            Stage::ChannelMapping(p) => p,
            Stage::Trimming(p) => p,
            Stage::SilenceSkipping(p) => p,
            Stage::Speed(p) => p,
            Stage::Resampling(p) => p,
            Stage::Custom(p) => p.as_ref(),
        }
    }

    fn processor_mut(&mut self) -> &mut dyn AudioProcessor {
        match self {
            Stage::ToInt16(p) => p,
            Stage::ToFloat(p) => p,
            Stage::ChannelMapping(p) => p,
            Stage::Trimming(p) => p,
            Stage::SilenceSkipping(p) => p,
            Stage::Speed(p) => p,
            Stage::Resampling(p) => p,
            Stage::Custom(p) => p.as_mut(),
        }
    }
}

/// Ordered stages plus the buffers handed between them.
pub struct ProcessingChain {
    stages: Vec<Stage>,
    /// Indices into `stages` of the stages in the data path, in order.
    active: Vec<usize>,
    /// `outputs[i]` holds what `active[i]` produced and its successor has not consumed.
    outputs: Vec<AudioBuf>,
    input_ended: bool,
    pending_output: Option<PcmSpec>,
    output: Option<PcmSpec>,
}

impl ProcessingChain {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self {
            stages,
            active: Vec::new(),
            outputs: Vec::new(),
            input_ended: false,
            pending_output: None,
            output: None,
        }
    }

    /// Output format [`configure`](Self::configure) would settle on for `input`, without
    /// staging anything.
    pub fn preview(&self, input: PcmSpec) -> Result<PcmSpec, UnhandledFormat> {
        let mut current = input;
        for stage in &self.stages {
            if let Some(out) = stage.processor().output_format(current)? {
                current = out;
            }
        }
        Ok(current)
    }

    /// Configure every stage for `input`; the result applies from the next [`flush`](Self::flush).
    ///
    /// A format some stage rejects leaves every stage as it was.
    pub fn configure(&mut self, input: PcmSpec) -> Result<PcmSpec, UnhandledFormat> {
        self.preview(input)?;
        let mut current = input;
        for stage in &mut self.stages {
            if let Some(out) = stage.processor_mut().configure(current)? {
                current = out;
            }
        }
        self.pending_output = Some(current);
        Ok(current)
    }

    /// Output format in effect since the last flush.
    pub fn output_spec(&self) -> Option<PcmSpec> {
        self.output
    }

    /// At least one stage is active.
    pub fn is_operational(&self) -> bool {
        !self.active.is_empty()
    }

    /// Flush every stage and rebuild the set of active stages.
    pub fn flush(&mut self) {
        self.output = self.pending_output;
        self.input_ended = false;
        self.active.clear();
        for (index, stage) in self.stages.iter_mut().enumerate() {
            let processor = stage.processor_mut();
            processor.flush();
            if processor.is_active() {
                self.active.push(index);
            }
        }
        self.outputs = vec![AudioBuf::new(); self.active.len()];
        tracing::debug!(
            active = ?self.active_stage_names(),
            "processing chain flushed"
        );
    }

    /// Reset every stage to its unconfigured state.
    pub fn reset(&mut self) {
        for stage in &mut self.stages {
            stage.processor_mut().reset();
        }
        self.active.clear();
        self.outputs.clear();
        self.input_ended = false;
        self.pending_output = None;
        self.output = None;
    }

    pub fn active_stage_names(&self) -> Vec<&'static str> {
        self.active
            .iter()
            .map(|&i| self.stages[i].processor().name())
            .collect()
    }

    /// Push as much of `input` through the chain as backpressure allows.
    pub fn queue_input(&mut self, input: &mut AudioBuf) {
        if !self.is_operational() || self.input_ended {
            return;
        }
        self.process(input);
    }

    /// Final stage output. The caller consumes it by advancing the buffer.
    pub fn output(&mut self) -> &mut AudioBuf {
        if !self.is_operational() {
            // Keep the contract of always handing out a buffer.
            self.outputs.clear();
            self.outputs.push(AudioBuf::new());
            return &mut self.outputs[0];
        }
        let last = self.active.len() - 1;
        if !self.outputs[last].has_remaining() {
            self.process(&mut AudioBuf::new());
        }
        &mut self.outputs[last]
    }

    /// Signal end of stream to the first active stage; it propagates downstream as
    /// each stage finishes.
    pub fn queue_end_of_stream(&mut self) {
        if !self.is_operational() || self.input_ended {
            return;
        }
        self.input_ended = true;
        let first = self.active[0];
        self.stages[first].processor_mut().queue_end_of_stream();
    }

    /// End of stream reached the last stage and its output was fully consumed.
    pub fn is_ended(&self) -> bool {
        let Some(&last_index) = self.active.last() else {
            return false;
        };
        self.input_ended
            && self.stages[last_index].processor().is_ended()
            && !self.outputs[self.active.len() - 1].has_remaining()
    }

    fn process(&mut self, input: &mut AudioBuf) {
        while self.process_pass(input) {}
    }

    /// One pass over the active stages. Returns whether any stage made progress.
    fn process_pass(&mut self, input: &mut AudioBuf) -> bool {
        let mut progressed = false;
        let last = self.active.len() - 1;
        for slot in 0..self.active.len() {
            if self.outputs[slot].has_remaining() {
                // Downstream has not taken this yet.
                continue;
            }
            let index = self.active[slot];
            if self.stages[index].processor().is_ended() {
                if slot < last {
                    let next = self.active[slot + 1];
                    let next_stage = self.stages[next].processor_mut();
                    if !next_stage.is_ended() {
                        next_stage.queue_end_of_stream();
                    }
                }
                continue;
            }

            let (upstream, rest) = self.outputs.split_at_mut(slot);
            let source: &mut AudioBuf = if slot == 0 { &mut *input } else { &mut upstream[slot - 1] };
            let before = source.remaining();
            let stage = self.stages[index].processor_mut();
            stage.queue_input(source);
            rest[0] = stage.take_output();
            progressed |= source.remaining() < before || rest[0].has_remaining();
        }
        progressed
    }

    pub fn trimming_mut(&mut self) -> Option<&mut Trimming> {
        self.stages.iter_mut().find_map(|s| match s {
            Stage::Trimming(p) => Some(p),
            _ => None,
        })
    }

    pub fn trimming(&self) -> Option<&Trimming> {
        self.stages.iter().find_map(|s| match s {
            Stage::Trimming(p) => Some(p),
            _ => None,
        })
    }

    pub fn channel_mapping_mut(&mut self) -> Option<&mut ChannelMapping> {
        self.stages.iter_mut().find_map(|s| match s {
            Stage::ChannelMapping(p) => Some(p),
            _ => None,
        })
    }

    pub fn silence_skipping_mut(&mut self) -> Option<&mut SilenceSkipping> {
        self.stages.iter_mut().find_map(|s| match s {
            Stage::SilenceSkipping(p) => Some(p),
            _ => None,
        })
    }

    pub fn silence_skipping(&self) -> Option<&SilenceSkipping> {
        self.stages.iter().find_map(|s| match s {
            Stage::SilenceSkipping(p) => Some(p),
            _ => None,
        })
    }

    pub fn speed_mut(&mut self) -> Option<&mut SpeedChange> {
        self.stages.iter_mut().find_map(|s| match s {
            Stage::Speed(p) => Some(p),
            _ => None,
        })
    }

    pub fn speed(&self) -> Option<&SpeedChange> {
        self.stages.iter().find_map(|s| match s {
            Stage::Speed(p) => Some(p),
            _ => None,
        })
    }

    pub fn resampling_mut(&mut self) -> Option<&mut Resampling> {
        self.stages.iter_mut().find_map(|s| match s {
            Stage::Resampling(p) => Some(p),
            _ => None,
        })
    }

    /// Media time covered by `playout_us` of chain output at the achieved speed.
    pub fn media_duration_for_playout_duration(&self, playout_us: i64) -> i64 {
        match self.speed() {
            Some(speed) if speed.is_active() => speed.media_duration_for_playout_duration(playout_us),
            _ => playout_us,
        }
    }

    /// Frames dropped by silence skipping (monotonic until reset).
    pub fn skipped_output_frame_count(&self) -> u64 {
        self.silence_skipping()
            .map(SilenceSkipping::skipped_frame_count)
            .unwrap_or(0)
    }

    /// Media time dropped by silence skipping.
    pub fn skipped_duration_us(&self) -> i64 {
        self.silence_skipping()
            .map(SilenceSkipping::skipped_duration_us)
            .unwrap_or(0)
    }
}

/// Which chain a configuration runs its PCM through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainKind {
    /// 16-bit output; speed, silence skipping and trimming are available.
    Int16,
    /// 32-bit float output for high-resolution sources.
    Float,
}

/// The two processing chains owned by a sink.
pub struct ChainSet {
    pub int16: ProcessingChain,
    pub float: ProcessingChain,
}

impl ChainSet {
    /// Build both chains. `custom` stages run after trimming and before silence skipping.
    pub fn new(config: &SinkConfig, custom: Vec<Box<dyn AudioProcessor>>) -> Self {
        let mut channel_mapping = ChannelMapping::new();
        channel_mapping.set_channel_map(config.channel_map.clone());
        let mut resampling = Resampling::new(config.resample_chunk_frames);
        resampling.set_output_sample_rate(config.output_sample_rate);

        let mut stages = vec![
            Stage::ToInt16(ToInt16Pcm::new()),
            Stage::ChannelMapping(channel_mapping),
            Stage::Trimming(Trimming::new()),
        ];
        stages.extend(custom.into_iter().map(Stage::Custom));
        stages.push(Stage::SilenceSkipping(SilenceSkipping::new(SilenceSkippingConfig {
            threshold: config.silence_threshold,
            min_silence_duration_us: config.min_silence_duration_us,
            padding_us: config.silence_padding_us,
        })));
        stages.push(Stage::Speed(SpeedChange::new()));
        stages.push(Stage::Resampling(resampling));

        Self {
            int16: ProcessingChain::new(stages),
            float: ProcessingChain::new(vec![Stage::ToFloat(ToFloatPcm::new())]),
        }
    }

    pub fn get(&self, kind: ChainKind) -> &ProcessingChain {
        match kind {
            ChainKind::Int16 => &self.int16,
            ChainKind::Float => &self.float,
        }
    }

    pub fn get_mut(&mut self, kind: ChainKind) -> &mut ProcessingChain {
        match kind {
            ChainKind::Int16 => &mut self.int16,
            ChainKind::Float => &mut self.float,
        }
    }

    pub fn reset(&mut self) {
        self.int16.reset();
        self.float.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Encoding;
    use crate::processor::test_util::{pcm16, samples};

    /// Emits its input only once it has collected `hold` samples.
    struct Batcher {
        hold: usize,
        held: Vec<u8>,
        out: AudioBuf,
        ended: bool,
    }

    impl AudioProcessor for Batcher {
        fn name(&self) -> &'static str {
            "batcher"
        }
        fn output_format(&self, input: PcmSpec) -> Result<Option<PcmSpec>, UnhandledFormat> {
            Ok(Some(input))
        }
        fn configure(&mut self, input: PcmSpec) -> Result<Option<PcmSpec>, UnhandledFormat> {
            Ok(Some(input))
        }
        fn is_active(&self) -> bool {
            true
        }
        fn queue_input(&mut self, input: &mut AudioBuf) {
            let n = input.remaining();
            self.held.extend_from_slice(input.take(n));
            if self.held.len() >= self.hold * 2 {
                self.out = AudioBuf::from_vec(std::mem::take(&mut self.held));
            }
        }
        fn queue_end_of_stream(&mut self) {
            self.out = AudioBuf::from_vec(std::mem::take(&mut self.held));
            self.ended = true;
        }
        fn take_output(&mut self) -> AudioBuf {
            std::mem::take(&mut self.out)
        }
        fn is_ended(&self) -> bool {
            self.ended && !self.out.has_remaining()
        }
        fn flush(&mut self) {
            self.held.clear();
            self.out.clear();
            self.ended = false;
        }
        fn reset(&mut self) {
            self.flush();
        }
    }

    fn chain_with(hold: usize, speed: f32) -> ProcessingChain {
        let mut speed_stage = SpeedChange::new();
        speed_stage.set_speed(speed);
        let mut chain = ProcessingChain::new(vec![
            Stage::ToInt16(ToInt16Pcm::new()),
            Stage::Custom(Box::new(Batcher {
                hold,
                held: Vec::new(),
                out: AudioBuf::new(),
                ended: false,
            })),
            Stage::Speed(speed_stage),
        ]);
        chain
            .configure(PcmSpec::new(48_000, 1, Encoding::Pcm16))
            .unwrap();
        chain.flush();
        chain
    }

    #[test]
    fn inactive_stages_are_excluded() {
        let chain = chain_with(1, 1.0);
        assert_eq!(chain.active_stage_names(), vec!["batcher"]);
    }

    #[test]
    fn data_flows_through_buffering_stage() {
        let mut chain = chain_with(4, 1.0);
        let mut input = pcm16(&[1, 2]);
        chain.queue_input(&mut input);
        assert!(!input.has_remaining());
        assert!(!chain.output().has_remaining());

        let mut input = pcm16(&[3, 4]);
        chain.queue_input(&mut input);
        assert_eq!(samples(chain.output()), vec![1, 2, 3, 4]);
    }

    #[test]
    fn unconsumed_output_applies_backpressure() {
        let mut chain = chain_with(1, 1.0);
        let mut first = pcm16(&[1]);
        chain.queue_input(&mut first);
        let mut second = pcm16(&[2]);
        chain.queue_input(&mut second);
        // The first output still occupies the final slot, so the new input is refused.
        assert!(second.has_remaining());
        assert_eq!(samples(chain.output()), vec![1]);
        chain.output().advance(2);
        chain.queue_input(&mut second);
        assert!(!second.has_remaining());
        assert_eq!(samples(chain.output()), vec![2]);
    }

    #[test]
    fn end_of_stream_propagates_and_drains() {
        let mut chain = chain_with(100, 2.0);
        let mut input = pcm16(&(0..8).collect::<Vec<i16>>());
        chain.queue_input(&mut input);
        chain.queue_end_of_stream();
        let mut drained = Vec::new();
        while !chain.is_ended() {
            let out = chain.output();
            drained.extend(samples(out));
            let n = out.remaining();
            out.advance(n);
        }
        assert_eq!(drained, vec![0, 2, 4, 6]);
    }

    #[test]
    fn configure_reports_final_output_format() {
        let mut chain = ProcessingChain::new(vec![Stage::ToInt16(ToInt16Pcm::new())]);
        let out = chain
            .configure(PcmSpec::new(44_100, 2, Encoding::PcmFloat))
            .unwrap();
        assert_eq!(out.encoding, Encoding::Pcm16);
        assert!(chain.output_spec().is_none());
        chain.flush();
        assert_eq!(chain.output_spec(), Some(out));
    }
}
