//! Optional anomaly scoring, pluggable behind the `AnomalyScorer` trait.
//!
//! With no scorer configured the detector simply never evaluates the
//! `anomaly` rule - it isn't absent by special-casing, it's absent because
//! nothing implements the trait. The neural implementation below is gated
//! behind the `ml-scorer` feature so a build without it never touches candle.

use crate::types::Feature;

/// Scores a flow feature for anomalousness. Lower is more anomalous; the
/// detector fires the `anomaly` rule when the score drops below `-0.5`.
pub trait AnomalyScorer: Send + Sync {
    fn score(&self, feature: &Feature) -> anyhow::Result<f32>;
}

#[cfg(feature = "ml-scorer")]
pub use neural::NeuralAnomalyScorer;

#[cfg(feature = "ml-scorer")]
mod neural {
    use std::sync::Arc;

    use anyhow::Result;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::ops;
    use candle_nn::{linear, Linear, Module, VarBuilder, VarMap};
    use parking_lot::RwLock;
    use tracing::info;

    use super::AnomalyScorer;
    use crate::types::Feature;

    const INPUT_SIZE: usize = 14;
    const HIDDEN_SIZE: usize = 32;

    /// Small feedforward net producing a sigmoid "anomaly probability" from a
    /// fixed-width feature vector. Never trained online in this crate - load
    /// pretrained weights via [`NeuralAnomalyScorer::load`], or use
    /// [`NeuralAnomalyScorer::untrained`] for a scorer that always reports 0
    /// (useful for wiring the pipeline up before a model exists).
    struct AnomalyNet {
        layer1: Linear,
        layer2: Linear,
        output: Linear,
    }

    impl AnomalyNet {
        fn new(vb: &VarBuilder) -> candle_core::Result<Self> {
            Ok(Self {
                layer1: linear(INPUT_SIZE, HIDDEN_SIZE, vb.pp("layer1"))?,
                layer2: linear(HIDDEN_SIZE, HIDDEN_SIZE / 2, vb.pp("layer2"))?,
                output: linear(HIDDEN_SIZE / 2, 1, vb.pp("output"))?,
            })
        }
    }

    impl Module for AnomalyNet {
        fn forward(&self, input: &Tensor) -> candle_core::Result<Tensor> {
            let x = self.layer1.forward(input)?.relu()?;
            let x = self.layer2.forward(&x)?.relu()?;
            let x = self.output.forward(&x)?;
            ops::sigmoid(&x)
        }
    }

    pub struct NeuralAnomalyScorer {
        model: Arc<RwLock<AnomalyNet>>,
        device: Device,
        #[allow(dead_code)]
        var_map: VarMap,
    }

    impl NeuralAnomalyScorer {
        /// A scorer with freshly initialized (untrained) weights. Every
        /// feature scores close to the sigmoid midpoint until real weights
        /// are loaded on top of `var_map`.
        pub fn untrained() -> Result<Self> {
            info!("initializing anomaly scorer with untrained weights");
            let device = Device::Cpu;
            let var_map = VarMap::new();
            let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
            let model = AnomalyNet::new(&vb)?;
            Ok(Self {
                model: Arc::new(RwLock::new(model)),
                device,
                var_map,
            })
        }

        /// Loads weights from a safetensors file produced by training this
        /// architecture offline.
        pub fn load(path: &str) -> Result<Self> {
            let device = Device::Cpu;
            let mut var_map = VarMap::new();
            var_map.load(path)?;
            let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
            let model = AnomalyNet::new(&vb)?;
            Ok(Self {
                model: Arc::new(RwLock::new(model)),
                device,
                var_map,
            })
        }

        fn feature_vector(feature: &Feature) -> Vec<f32> {
            let mut v = vec![
                feature.duration_secs,
                feature.packet_count as f32,
                feature.byte_count as f32,
                feature.packets_per_second,
                feature.bytes_per_second,
                feature.avg_packet_size,
                feature.port_entropy,
                feature.packet_size_variance,
                feature.syn_count as f32,
                feature.ack_count as f32,
                feature.fin_count as f32,
                feature.rst_count as f32,
                if feature.protocol == crate::types::Protocol::Tcp { 1.0 } else { 0.0 },
                if feature.protocol == crate::types::Protocol::Udp { 1.0 } else { 0.0 },
            ];
            v.resize(INPUT_SIZE, 0.0);
            v
        }
    }

    impl AnomalyScorer for NeuralAnomalyScorer {
        fn score(&self, feature: &Feature) -> Result<f32> {
            let input = Self::feature_vector(feature);
            let tensor = Tensor::from_vec(input, (1, INPUT_SIZE), &self.device)?;
            let model = self.model.read();
            let output = model.forward(&tensor)?;
            let anomaly_prob = output.to_vec1::<f32>()?[0];
            // Invert so a more-anomalous flow yields a lower score, matching
            // the detector's `score < -0.5` firing condition.
            Ok(-anomaly_prob)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::types::{Protocol, TcpFlags};

        fn sample_feature() -> Feature {
            Feature {
                flow_key_display: String::new(),
                src_ip: "10.0.0.1".parse().unwrap(),
                dst_ip: "10.0.0.2".parse().unwrap(),
                src_port: 1234,
                dst_port: 80,
                protocol: Protocol::Tcp,
                duration_secs: 1.0,
                packet_count: 10,
                byte_count: 1000,
                packets_per_second: 10.0,
                bytes_per_second: 1000.0,
                avg_packet_size: 100.0,
                port_entropy: 0.5,
                packet_size_variance: 10.0,
                syn_count: 1,
                ack_count: 5,
                fin_count: 1,
                rst_count: 0,
                last_flags: TcpFlags::default(),
                saw_syn_fin: false,
            }
        }

        #[test]
        fn untrained_scorer_produces_a_bounded_score() {
            let scorer = NeuralAnomalyScorer::untrained().expect("init");
            let score = scorer.score(&sample_feature()).expect("score");
            assert!((-1.0..=0.0).contains(&score));
        }
    }
}
