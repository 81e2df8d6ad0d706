use itertools::izip;

/// Stochastic gradient descent with momentum.
///
/// Each step updates a velocity per parameter, `v = momentum · v − learning_rate · g`,
/// and moves the parameter by it. Velocities are sized on the first step.
#[derive(Debug, Clone)]
pub struct Sgd {
    learning_rate: f32,
    momentum: f32,
    velocities: Vec<Vec<f32>>,
}

impl Sgd {
    pub fn new(learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            velocities: Vec::new(),
        }
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    /// Applies one update. `parameters` and `gradients` must pair up slice by slice.
    pub fn step(&mut self, parameters: Vec<&mut [f32]>, gradients: Vec<&[f32]>) {
        assert_eq!(
            parameters.len(),
            gradients.len(),
            "Parameters and gradients must have the same length"
        );

        if self.velocities.len() != parameters.len() {
            self.velocities = parameters.iter().map(|p| vec![0.0; p.len()]).collect();
        }

        for (params, grads, velocity) in izip!(parameters, gradients, &mut self.velocities) {
            for (p, g, v) in izip!(params.iter_mut(), grads, velocity.iter_mut()) {
                *v = self.momentum * *v - self.learning_rate * g;
                *p += *v;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn first_step_is_plain_gradient_descent() {
        let mut sgd = Sgd::new(0.1, 0.9);
        let mut w = vec![1.0f32, 2.0];
        let mut b = vec![0.5f32];

        sgd.step(
            vec![w.as_mut_slice(), b.as_mut_slice()],
            vec![&[1.0, -2.0][..], &[0.5][..]],
        );

        assert_relative_eq!(w[0], 0.9, epsilon = 1e-6);
        assert_relative_eq!(w[1], 2.2, epsilon = 1e-6);
        assert_relative_eq!(b[0], 0.45, epsilon = 1e-6);
    }

    #[test]
    fn momentum_accumulates_velocity() {
        let mut sgd = Sgd::new(0.1, 0.9);
        let mut w = vec![0.0f32];

        sgd.step(vec![w.as_mut_slice()], vec![&[1.0][..]]);
        sgd.step(vec![w.as_mut_slice()], vec![&[1.0][..]]);

        // v1 = -0.1, v2 = 0.9 * -0.1 - 0.1 = -0.19
        assert_relative_eq!(w[0], -0.29, epsilon = 1e-6);

        // a zero gradient still coasts on the velocity
        sgd.step(vec![w.as_mut_slice()], vec![&[0.0][..]]);
        assert_relative_eq!(w[0], -0.29 - 0.171, epsilon = 1e-6);
    }

    #[test]
    #[should_panic(expected = "same length")]
    fn mismatched_lists_panic() {
        let mut sgd = Sgd::new(0.1, 0.0);
        let mut w = vec![0.0f32];

        sgd.step(vec![w.as_mut_slice()], vec![]);
    }
}
