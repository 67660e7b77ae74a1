/// Small constant added to denominators of box ratios.
pub const EPSILON: f64 = 1e-16;
