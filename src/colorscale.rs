use anyhow::{Result, anyhow, bail};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub fn to_hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.0, self.1, self.2)
    }
}

/// Parses `#rrggbb` (case-insensitive, leading `#` optional).
pub fn parse_hex(hex: &str) -> Result<Rgb> {
    let digits = hex.trim_start_matches('#');
    if digits.len() != 6 || !digits.is_ascii() {
        bail!("Invalid hex color: {}", hex);
    }
    let channel = |range: std::ops::Range<usize>| {
        u8::from_str_radix(&digits[range], 16).map_err(|_| anyhow!("Invalid hex color: {}", hex))
    };
    Ok(Rgb(channel(0..2)?, channel(2..4)?, channel(4..6)?))
}

/// Linear-interpolated quantile of already sorted values.
fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}

/// Breakpoints of `values` at each of `probabilities` (each within `[0, 1]`).
pub fn quantile_breaks(values: &[f64], probabilities: &[f64]) -> Result<Vec<f64>> {
    if values.is_empty() {
        bail!("Cannot compute quantiles of an empty column");
    }
    if values.iter().any(|v| !v.is_finite()) {
        bail!("Cannot compute quantiles over non-finite values");
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    Ok(probabilities.iter().map(|&q| quantile_sorted(&sorted, q.clamp(0.0, 1.0))).collect())
}

/// Discrete color scale: `colors[i]` covers `[index[i], index[i + 1])`.
#[derive(Debug, Clone)]
pub struct StepColorScale {
    colors: Vec<Rgb>,
    index: Vec<f64>,
}

impl StepColorScale {
    pub fn new(colors: &[String], index: Vec<f64>) -> Result<Self> {
        if colors.is_empty() {
            bail!("Color scale needs at least one color");
        }
        if index.len() != colors.len() + 1 {
            bail!("Color scale with {} colors needs {} breakpoints, got {}", colors.len(), colors.len() + 1, index.len());
        }
        if index.windows(2).any(|w| w[0] > w[1]) {
            bail!("Color scale breakpoints must be non-decreasing");
        }
        let colors = colors.iter().map(|c| parse_hex(c)).collect::<Result<Vec<_>>>()?;
        Ok(Self { colors, index })
    }

    /// Quantile breakpoints of `values`, one more than there are colors.
    pub fn from_quantiles(colors: &[String], values: &[f64], probabilities: &[f64]) -> Result<Self> {
        let breaks = quantile_breaks(values, probabilities)?;
        Self::new(colors, breaks)
    }

    pub fn vmin(&self) -> f64 {
        self.index[0]
    }

    pub fn vmax(&self) -> f64 {
        self.index[self.index.len() - 1]
    }

    pub fn breaks(&self) -> &[f64] {
        &self.index
    }

    pub fn color(&self, value: f64) -> Rgb {
        let last = self.colors.len() - 1;
        if value <= self.vmin() {
            return self.colors[0];
        }
        if value >= self.vmax() {
            return self.colors[last];
        }
        let below = self.index.iter().filter(|&&b| b <= value).count();
        self.colors[(below - 1).min(last)]
    }

    pub fn hex(&self, value: f64) -> String {
        self.color(value).to_hex()
    }
}
