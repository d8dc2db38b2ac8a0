//! Derivative-free minimisation over the six rigid-body parameters

/// Coordinate pattern search
///
/// Each parameter is probed in both directions by its current step; an
/// improving move is repeated (with doubling) while it keeps improving.
/// When a full sweep finds no improvement all steps are halved. The search
/// stops once every step falls below its tolerance or the evaluation budget
/// is spent.
#[derive(Debug, Clone)]
pub struct PatternSearch {
    pub steps: [f64; 6],
    pub tolerance: [f64; 6],
    pub max_evaluations: usize,
}

/// Outcome of a minimisation
#[derive(Debug, Clone, Copy)]
pub struct Minimum {
    pub params: [f64; 6],
    pub cost: f64,
    pub evaluations: usize,
}

impl PatternSearch {
    pub fn minimise<F>(&self, start: [f64; 6], mut cost: F) -> Minimum
    where
        F: FnMut(&[f64; 6]) -> f64,
    {
        let mut x = start;
        let mut best = cost(&x);
        let mut evaluations = 1;
        let mut steps = self.steps;

        'search: loop {
            let mut improved = false;

            for d in 0..6 {
                for sign in [1.0, -1.0] {
                    let mut trial = x;
                    trial[d] += sign * steps[d];
                    let c = cost(&trial);
                    evaluations += 1;
                    if c < best {
                        best = c;
                        x = trial;
                        improved = true;

                        // Keep going while the direction pays off
                        let mut stride = 2.0 * steps[d];
                        loop {
                            if evaluations >= self.max_evaluations {
                                break 'search;
                            }
                            let mut ext = x;
                            ext[d] += sign * stride;
                            let c = cost(&ext);
                            evaluations += 1;
                            if c < best {
                                best = c;
                                x = ext;
                                stride *= 2.0;
                            } else {
                                break;
                            }
                        }
                        break;
                    }
                    if evaluations >= self.max_evaluations {
                        break 'search;
                    }
                }
            }

            if !improved {
                for s in steps.iter_mut() {
                    *s *= 0.5;
                }
                if steps.iter().zip(&self.tolerance).all(|(s, t)| s < t) {
                    break;
                }
            }
        }

        Minimum { params: x, cost: best, evaluations }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search() -> PatternSearch {
        PatternSearch {
            steps: [1.0; 6],
            tolerance: [1e-4; 6],
            max_evaluations: 20_000,
        }
    }

    #[test]
    fn test_quadratic_minimum() {
        let target = [3.0, -2.0, 0.5, 0.1, -0.2, 0.05];
        let m = search().minimise([0.0; 6], |p| {
            p.iter().zip(&target).map(|(a, b)| (a - b).powi(2)).sum()
        });
        for i in 0..6 {
            assert!((m.params[i] - target[i]).abs() < 1e-3, "param {}: {}", i, m.params[i]);
        }
        assert!(m.cost < 1e-6);
    }

    #[test]
    fn test_coupled_quadratic() {
        let m = search().minimise([0.0; 6], |p| {
            (p[0] + p[1] - 4.0).powi(2) + (p[0] - p[1]).powi(2) + p[2..].iter().map(|v| v * v).sum::<f64>()
        });
        assert!((m.params[0] - 2.0).abs() < 1e-2);
        assert!((m.params[1] - 2.0).abs() < 1e-2);
    }

    #[test]
    fn test_evaluation_budget() {
        let mut s = search();
        s.max_evaluations = 10;
        let m = s.minimise([0.0; 6], |p| -p[0]);
        assert!(m.evaluations <= 11);
    }
}
