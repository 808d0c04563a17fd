//! Text classifier: embedding, bidirectional LSTM, dense projection, class head

use candle_core::{Device, Tensor, D};
use candle_nn::rnn::{lstm, LSTMConfig, LSTM, RNN};
use candle_nn::{embedding, linear, Embedding, Linear, Module, VarBuilder};

use crate::error::{Error, Result};

/// Shape of one classifier instance.
///
/// The embedding table is sized by the vocabulary at construction, so the
/// vocabulary must be final before the model is built.
#[derive(Debug, Clone, Copy)]
pub struct ClassifierConfig {
    /// Vocabulary size (embedding rows)
    pub vocab_size: usize,
    /// Embedding width
    pub embedding_dim: usize,
    /// LSTM hidden size per direction
    pub hidden_dim: usize,
    /// Output classes
    pub num_classes: usize,
}

/// Layered classifier over fixed-length id sequences.
///
/// Bidirectionality comes from two independent LSTMs, the second reading
/// the sequence reversed; their final hidden states are concatenated.
pub struct TextClassifier {
    embedding: Embedding,
    forward_lstm: LSTM,
    backward_lstm: LSTM,
    dense: Linear,
    head: Linear,
}

impl TextClassifier {
    /// Build the model's layers under the given variable namespace
    pub fn new(config: &ClassifierConfig, vb: VarBuilder) -> Result<Self> {
        let embedding = embedding(config.vocab_size, config.embedding_dim, vb.pp("embed"))?;
        let forward_lstm = lstm(
            config.embedding_dim,
            config.hidden_dim,
            LSTMConfig::default(),
            vb.pp("lstm_fwd"),
        )?;
        let backward_lstm = lstm(
            config.embedding_dim,
            config.hidden_dim,
            LSTMConfig::default(),
            vb.pp("lstm_bwd"),
        )?;
        let dense = linear(config.hidden_dim * 2, config.hidden_dim, vb.pp("dense"))?;
        let head = linear(config.hidden_dim, config.num_classes, vb.pp("head"))?;

        Ok(Self {
            embedding,
            forward_lstm,
            backward_lstm,
            dense,
            head,
        })
    }

    /// Compute class logits for a `(batch, seq_len)` U32 id tensor
    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let (_batch, seq_len) = ids.dims2()?;
        let embedded = self.embedding.forward(ids)?;

        let forward_states = self.forward_lstm.seq(&embedded)?;
        let h_forward = forward_states
            .last()
            .ok_or_else(|| Error::compute("sequence produced no recurrent states"))?
            .h()
            .clone();

        let reverse_idx: Vec<u32> = (0..seq_len as u32).rev().collect();
        let reverse_idx = Tensor::from_vec(reverse_idx, seq_len, embedded.device())?;
        let reversed = embedded.index_select(&reverse_idx, 1)?;
        let backward_states = self.backward_lstm.seq(&reversed)?;
        let h_backward = backward_states
            .last()
            .ok_or_else(|| Error::compute("sequence produced no recurrent states"))?
            .h()
            .clone();

        let merged = Tensor::cat(&[&h_forward, &h_backward], 1)?;
        let hidden = self.dense.forward(&merged)?.relu()?;
        Ok(self.head.forward(&hidden)?)
    }

    /// Predict class indices for a `(batch, seq_len)` U32 id tensor
    pub fn predict(&self, ids: &Tensor) -> Result<Tensor> {
        let logits = self.forward(ids)?;
        Ok(logits.argmax(D::Minus1)?)
    }
}

/// Fraction of predictions matching the targets
pub fn accuracy(logits: &Tensor, targets: &Tensor) -> Result<f64> {
    let predicted = logits.argmax(D::Minus1)?;
    let correct = predicted
        .eq(targets)?
        .to_dtype(candle_core::DType::F32)?
        .mean_all()?
        .to_scalar::<f32>()?;
    Ok(correct as f64)
}

/// Build a `(batch, seq_len)` U32 tensor from id rows
pub fn ids_tensor(rows: &[Vec<u32>], device: &Device) -> Result<Tensor> {
    let batch = rows.len();
    let seq_len = rows.first().map(Vec::len).unwrap_or(0);
    let flat: Vec<u32> = rows.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(flat, (batch, seq_len), device)?)
}

/// Build a `(batch,)` U32 label tensor
pub fn labels_tensor(labels: &[u32], device: &Device) -> Result<Tensor> {
    Ok(Tensor::from_vec(labels.to_vec(), labels.len(), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::DType;
    use candle_nn::VarMap;

    fn tiny() -> (TextClassifier, Device) {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = TextClassifier::new(
            &ClassifierConfig {
                vocab_size: 12,
                embedding_dim: 8,
                hidden_dim: 4,
                num_classes: 3,
            },
            vb,
        )
        .unwrap();
        (model, device)
    }

    #[test]
    fn forward_produces_class_logits() {
        let (model, device) = tiny();
        let ids = ids_tensor(&[vec![1, 2, 3, 0, 0], vec![4, 5, 0, 0, 0]], &device).unwrap();
        let logits = model.forward(&ids).unwrap();
        assert_eq!(logits.dims(), &[2, 3]);
    }

    #[test]
    fn predict_returns_one_label_per_row() {
        let (model, device) = tiny();
        let ids = ids_tensor(&[vec![1, 2, 3], vec![4, 5, 6], vec![7, 8, 9]], &device).unwrap();
        let predicted = model.predict(&ids).unwrap();
        assert_eq!(predicted.dims(), &[3]);
        let values = predicted.to_vec1::<u32>().unwrap();
        assert!(values.iter().all(|&v| v < 3));
    }

    #[test]
    fn accuracy_of_perfect_match_is_one() {
        let device = Device::Cpu;
        // logits whose argmax is [0, 1]
        let logits = Tensor::new(&[[5.0f32, 0.0, 0.0], [0.0, 5.0, 0.0]], &device).unwrap();
        let targets = labels_tensor(&[0, 1], &device).unwrap();
        let acc = accuracy(&logits, &targets).unwrap();
        assert_abs_diff_eq!(acc, 1.0, epsilon = 1e-6);

        let wrong = labels_tensor(&[1, 1], &device).unwrap();
        let acc = accuracy(&logits, &wrong).unwrap();
        assert_abs_diff_eq!(acc, 0.5, epsilon = 1e-6);
    }
}
