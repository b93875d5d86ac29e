//! Gated recurrent unit layer.
//!
//! One `forward` call is one timestep. The hidden state is carried across
//! calls; backward-through-time is the history stack replayed in reverse,
//! with the hidden-state delta handed from each timestep to the previous one.

use crate::backend::BackendHandle;
use crate::error::{check_batch, check_len, NetworkError, Result};
use crate::layers::{not_bound, pop_step, record_step, BindContext, Initializer, Layer, Mode, Parameter};
use crate::optimizers::OptimizerKind;
use crate::serialization::{expect_shape, ModelReader, ModelWriter};
use crate::tensor::{buffer_len, Shape};
use crate::utils::Activation;

pub const TYPE_TAG: &str = "gru";

/// Hidden value used at the start of every sequence in `GradientCheck` mode.
pub const GRADIENT_CHECK_HIDDEN: f32 = 0.1;

/// Gated recurrent layer.
///
/// ```text
/// z  = g(Wx_z x + Wh_z h + b_z)          update gate
/// r  = g(Wx_r x + Wh_r h + b_r)          reset gate
/// hc = s(Wx_h x + Wh_h (r ⊙ h) + b_h)    candidate
/// h' = z ⊙ h + (1 - z) ⊙ hc
/// ```
///
/// `g` defaults to sigmoid and `s` to tanh. The output is `h'`.
pub struct GruLayer {
    hidden_size: usize,
    gate_activation: Activation,
    state_activation: Activation,
    initializer: Initializer,
    optimizer: Option<OptimizerKind>,
    input_shape: Shape,
    state: Option<GruState>,
    mode: Mode,
    hidden: Vec<f32>,
    hidden_delta: Vec<f32>,
    history: Vec<GruStep>,
}

/// Input-to-hidden, hidden-to-hidden and bias parameters of one gate.
struct Gate {
    input: Parameter,
    hidden: Parameter,
    bias: Parameter,
}

struct GruState {
    update: Gate,
    reset: Gate,
    candidate: Gate,
    backend: BackendHandle,
}

struct GruStep {
    input: Vec<f32>,
    hidden_prev: Vec<f32>,
    z: Vec<f32>,
    r: Vec<f32>,
    candidate: Vec<f32>,
    reset_hidden: Vec<f32>,
    output: Vec<f32>,
    batch_size: usize,
}

impl Gate {
    fn new(
        ctx: &mut BindContext,
        names: [&'static str; 3],
        n_in: usize,
        n_h: usize,
        initializer: Initializer,
        kind: OptimizerKind,
    ) -> Self {
        let wx = initializer.sample(n_h * n_in, n_in, n_h, &mut ctx.rng);
        let wh = initializer.sample(n_h * n_h, n_h, n_h, &mut ctx.rng);
        Self {
            input: ctx.parameter(names[0], wx, kind),
            hidden: ctx.parameter(names[1], wh, kind),
            bias: ctx.parameter(names[2], vec![0.0; n_h], kind),
        }
    }

    fn parameters(&self) -> [&Parameter; 3] {
        [&self.input, &self.hidden, &self.bias]
    }

    fn parameters_mut(&mut self) -> [&mut Parameter; 3] {
        [&mut self.input, &mut self.hidden, &mut self.bias]
    }

    /// `x Wxᵀ + h Whᵀ + b` for every example.
    fn pre_activation(&self, backend: &BackendHandle, x: &[f32], h: &[f32], batch: usize) -> Vec<f32> {
        let n_h = self.bias.len();
        let n_in = x.len() / batch;
        let mut out = vec![0.0f32; batch * n_h];
        for row in out.chunks_exact_mut(n_h) {
            row.copy_from_slice(self.bias.values());
        }
        backend.multiply(false, true, batch, n_h, n_in, x, self.input.values(), &mut out, true);
        backend.multiply(false, true, batch, n_h, n_h, h, self.hidden.values(), &mut out, true);
        out
    }

    /// Accumulates parameter gradients for pre-activation delta `da` and
    /// adds its contributions to `dx` and `dh`.
    #[allow(clippy::too_many_arguments)]
    fn backward(
        &mut self,
        backend: &BackendHandle,
        da: &[f32],
        x: &[f32],
        h: &[f32],
        batch: usize,
        dx: &mut [f32],
        dh: &mut [f32],
    ) {
        let n_h = self.bias.len();
        let n_in = x.len() / batch;
        for row in da.chunks_exact(n_h) {
            for (g, &d) in self.bias.gradients_mut().iter_mut().zip(row) {
                *g += d;
            }
        }
        let (wx, wx_grad) = self.input.split_mut();
        backend.multiply(true, false, n_h, n_in, batch, da, x, wx_grad, true);
        backend.multiply(false, false, batch, n_in, n_h, da, wx, dx, true);
        let (wh, wh_grad) = self.hidden.split_mut();
        backend.multiply(true, false, n_h, n_h, batch, da, h, wh_grad, true);
        backend.multiply(false, false, batch, n_h, n_h, da, wh, dh, true);
    }
}

impl GruLayer {
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            gate_activation: Activation::Sigmoid,
            state_activation: Activation::Tanh,
            initializer: Initializer::default(),
            optimizer: None,
            input_shape: Shape::flat(0),
            state: None,
            mode: Mode::Train,
            hidden: Vec::new(),
            hidden_delta: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn with_activations(mut self, gate: Activation, state: Activation) -> Self {
        self.gate_activation = gate;
        self.state_activation = state;
        self
    }

    pub fn with_initializer(mut self, initializer: Initializer) -> Self {
        self.initializer = initializer;
        self
    }

    pub fn with_optimizer(mut self, kind: OptimizerKind) -> Self {
        self.optimizer = Some(kind);
        self
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Hidden state after the latest forward call (empty before the first).
    pub fn hidden_state(&self) -> &[f32] {
        &self.hidden
    }

    /// Hidden state entering the next timestep.
    fn initial_hidden(&self, batch_size: usize) -> Vec<f32> {
        let len = batch_size * self.hidden_size;
        if self.mode == Mode::GradientCheck && self.history.is_empty() {
            return vec![GRADIENT_CHECK_HIDDEN; len];
        }
        if self.hidden.len() == len {
            self.hidden.clone()
        } else {
            vec![0.0; len]
        }
    }

    pub(crate) fn import(reader: &mut ModelReader<'_>, ctx: &mut BindContext) -> Result<Self> {
        let input = reader.read_shape()?;
        let output = reader.read_shape()?;
        let hidden_size = reader.read_usize()?;
        let gate = Activation::from_tag(&reader.read_str()?)?;
        let state = Activation::from_tag(&reader.read_str()?)?;
        let initializer = Initializer::from_tag(&reader.read_str()?)?;
        let kind = OptimizerKind::from_tag(&reader.read_str()?)?;

        let mut layer = GruLayer::new(hidden_size)
            .with_activations(gate, state)
            .with_initializer(initializer)
            .with_optimizer(kind);
        let rebuilt = layer.bind(input, ctx).map_err(|e| NetworkError::Serialization(e.to_string()))?;
        expect_shape(output, rebuilt, TYPE_TAG)?;
        for parameter in layer.parameters_mut() {
            parameter.import(reader)?;
        }
        Ok(layer)
    }
}

impl Layer for GruLayer {
    fn type_tag(&self) -> &'static str {
        TYPE_TAG
    }

    fn bind(&mut self, input: Shape, ctx: &mut BindContext) -> Result<Shape> {
        input.validate()?;
        if self.hidden_size == 0 {
            return Err(NetworkError::InvalidShape(
                "gru hidden size must be positive".to_string(),
            ));
        }
        if !self.gate_activation.is_elementwise() || !self.state_activation.is_elementwise() {
            return Err(NetworkError::UnsupportedCombination(
                "gru gate and state activations must be element-wise".to_string(),
            ));
        }
        let (n_in, n_h) = (input.size(), self.hidden_size);
        buffer_len(&[n_h, n_in.max(n_h)])?;
        let kind = ctx.optimizer_kind(self.optimizer);
        let init = self.initializer;
        let update = Gate::new(ctx, ["wx_z", "wh_z", "b_z"], n_in, n_h, init, kind);
        let reset = Gate::new(ctx, ["wx_r", "wh_r", "b_r"], n_in, n_h, init, kind);
        let candidate = Gate::new(ctx, ["wx_h", "wh_h", "b_h"], n_in, n_h, init, kind);
        self.state = Some(GruState {
            update,
            reset,
            candidate,
            backend: ctx.backend.clone(),
        });
        self.optimizer = Some(kind);
        self.input_shape = input;
        self.clear_history();
        log::debug!("gru: {} -> {}", input, n_h);
        Ok(Shape::flat(n_h))
    }

    fn input_shape(&self) -> Shape {
        self.input_shape
    }

    fn output_shape(&self) -> Shape {
        Shape::flat(self.hidden_size)
    }

    fn forward(&mut self, input: &[f32], batch_size: usize) -> Result<Vec<f32>> {
        check_batch(batch_size)?;
        check_len(input.len(), batch_size * self.input_shape.size())?;
        let hidden_prev = self.initial_hidden(batch_size);
        let state = self.state.as_ref().ok_or_else(|| not_bound(TYPE_TAG))?;
        let backend = &state.backend;

        let mut z = state.update.pre_activation(backend, input, &hidden_prev, batch_size);
        self.gate_activation.apply(&mut z, batch_size);
        let mut r = state.reset.pre_activation(backend, input, &hidden_prev, batch_size);
        self.gate_activation.apply(&mut r, batch_size);
        let reset_hidden: Vec<f32> = r.iter().zip(&hidden_prev).map(|(r, h)| r * h).collect();
        let mut candidate = state
            .candidate
            .pre_activation(backend, input, &reset_hidden, batch_size);
        self.state_activation.apply(&mut candidate, batch_size);

        let output: Vec<f32> = z
            .iter()
            .zip(&hidden_prev)
            .zip(&candidate)
            .map(|((z, h), hc)| z * h + (1.0 - z) * hc)
            .collect();
        self.hidden = output.clone();

        record_step(
            &mut self.history,
            self.mode,
            GruStep {
                input: input.to_vec(),
                hidden_prev,
                z,
                r,
                candidate,
                reset_hidden,
                output: output.clone(),
                batch_size,
            },
        );
        Ok(output)
    }

    fn backward(&mut self, delta: &[f32], want_input_delta: bool) -> Result<Option<Vec<f32>>> {
        let step = pop_step(&mut self.history, TYPE_TAG)?;
        let batch_size = step.batch_size;
        check_len(delta.len(), step.output.len())?;
        let n_in = self.input_shape.size();
        let gate_act = self.gate_activation;
        let state_act = self.state_activation;

        // Delta on h' = delta from above + delta carried back from timestep t+1.
        let mut dh = delta.to_vec();
        if self.hidden_delta.len() == dh.len() {
            for (d, &carry) in dh.iter_mut().zip(&self.hidden_delta) {
                *d += carry;
            }
        }

        let len = dh.len();
        let mut dz = vec![0.0f32; len];
        let mut da_candidate = vec![0.0f32; len];
        let mut dh_prev = vec![0.0f32; len];
        for i in 0..len {
            let z = step.z[i];
            let hc = step.candidate[i];
            dz[i] = dh[i] * (step.hidden_prev[i] - hc) * gate_act.derivative_from_output(z);
            da_candidate[i] = dh[i] * (1.0 - z) * state_act.derivative_from_output(hc);
            dh_prev[i] = dh[i] * z;
        }

        let state = self.state.as_mut().ok_or_else(|| not_bound(TYPE_TAG))?;
        let backend = state.backend.clone();
        let mut dx = vec![0.0f32; batch_size * n_in];

        // Candidate gate reads r ⊙ h, so its hidden delta comes back through r.
        let mut d_reset_hidden = vec![0.0f32; len];
        state.candidate.backward(
            &backend,
            &da_candidate,
            &step.input,
            &step.reset_hidden,
            batch_size,
            &mut dx,
            &mut d_reset_hidden,
        );
        let mut dr = vec![0.0f32; len];
        for i in 0..len {
            dh_prev[i] += d_reset_hidden[i] * step.r[i];
            dr[i] = d_reset_hidden[i] * step.hidden_prev[i] * gate_act.derivative_from_output(step.r[i]);
        }
        state.reset.backward(
            &backend,
            &dr,
            &step.input,
            &step.hidden_prev,
            batch_size,
            &mut dx,
            &mut dh_prev,
        );
        state.update.backward(
            &backend,
            &dz,
            &step.input,
            &step.hidden_prev,
            batch_size,
            &mut dx,
            &mut dh_prev,
        );

        // The first timestep's incoming hidden state is a constant.
        self.hidden_delta = if self.history.is_empty() {
            Vec::new()
        } else {
            dh_prev
        };
        Ok(want_input_delta.then_some(dx))
    }

    fn last_output(&self) -> Option<(&[f32], usize)> {
        self.history.last().map(|s| (s.output.as_slice(), s.batch_size))
    }

    fn parameters(&self) -> Vec<&Parameter> {
        match &self.state {
            Some(s) => [&s.update, &s.reset, &s.candidate]
                .into_iter()
                .flat_map(Gate::parameters)
                .collect(),
            None => Vec::new(),
        }
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        match &mut self.state {
            Some(s) => [&mut s.update, &mut s.reset, &mut s.candidate]
                .into_iter()
                .flat_map(Gate::parameters_mut)
                .collect(),
            None => Vec::new(),
        }
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn set_mode(&mut self, mode: Mode) {
        if self.mode != mode {
            self.clear_history();
        }
        self.mode = mode;
    }

    fn clear_history(&mut self) {
        self.history.clear();
        self.hidden.clear();
        self.hidden_delta.clear();
    }

    fn export_state(&self, writer: &mut ModelWriter<'_>) -> Result<()> {
        writer.write_shape(self.input_shape)?;
        writer.write_shape(self.output_shape())?;
        writer.write_usize(self.hidden_size)?;
        writer.write_str(self.gate_activation.tag())?;
        writer.write_str(self.state_activation.tag())?;
        writer.write_str(self.initializer.tag())?;
        writer.write_str(self.optimizer.unwrap_or_default().tag())?;
        for parameter in self.parameters() {
            parameter.export(writer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn bound(input: usize, hidden: usize) -> GruLayer {
        let mut gru = GruLayer::new(hidden);
        gru.bind(Shape::flat(input), &mut BindContext::with_seed(11)).unwrap();
        gru
    }

    #[test]
    fn test_gru_parameter_layout() {
        let gru = bound(3, 4);
        let names: Vec<&str> = gru.parameters().iter().map(|p| p.name()).collect();
        assert_eq!(
            names,
            vec!["wx_z", "wh_z", "b_z", "wx_r", "wh_r", "b_r", "wx_h", "wh_h", "b_h"]
        );
        assert_eq!(gru.parameter_count(), 3 * (4 * 3 + 4 * 4 + 4));
    }

    #[test]
    fn test_gru_zero_weights_halve_candidate() {
        let mut gru = bound(2, 2);
        for p in gru.parameters_mut() {
            p.values_mut().iter_mut().for_each(|v| *v = 0.0);
        }
        // z = 0.5, hc = tanh(0) = 0, h = 0 -> h' = 0
        let out = gru.forward(&[1.0, -1.0], 1).unwrap();
        assert_eq!(out, vec![0.0, 0.0]);

        gru.parameters_mut()[8].values_mut().copy_from_slice(&[1.0, 1.0]);
        let out = gru.forward(&[1.0, -1.0], 1).unwrap();
        // h' = 0.5 * 0 + 0.5 * tanh(1)
        assert_relative_eq!(out[0], 0.5 * 1.0f32.tanh(), epsilon = 1e-6);
    }

    #[test]
    fn test_gru_hidden_state_carried_and_cleared() {
        let mut gru = bound(2, 3);
        let first = gru.forward(&[0.5, 0.5], 1).unwrap();
        let second = gru.forward(&[0.5, 0.5], 1).unwrap();
        assert_ne!(first, second);
        assert_eq!(gru.hidden_state(), second.as_slice());

        gru.clear_history();
        let again = gru.forward(&[0.5, 0.5], 1).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn test_gru_gradient_check_mode_uses_constant_start() {
        let mut gru = bound(2, 2);
        gru.set_mode(Mode::GradientCheck);
        gru.forward(&[0.3, 0.1], 1).unwrap();
        let step = gru.history.last().unwrap();
        assert_eq!(step.hidden_prev, vec![GRADIENT_CHECK_HIDDEN; 2]);
    }

    #[test]
    fn test_gru_backward_pops_in_reverse() {
        let mut gru = bound(2, 2);
        for _ in 0..3 {
            gru.forward(&[0.2, -0.4], 1).unwrap();
        }
        for _ in 0..3 {
            let dx = gru.backward(&[0.1, 0.1], true).unwrap().unwrap();
            assert_eq!(dx.len(), 2);
        }
        assert!(gru.backward(&[0.1, 0.1], true).is_err());
        assert!(gru.hidden_delta.is_empty());
    }

    #[test]
    fn test_gru_rejects_softmax_gate() {
        let mut gru = GruLayer::new(2).with_activations(Activation::Softmax, Activation::Tanh);
        let err = gru.bind(Shape::flat(2), &mut BindContext::with_seed(1));
        assert!(matches!(err, Err(NetworkError::UnsupportedCombination(_))));
    }
}
