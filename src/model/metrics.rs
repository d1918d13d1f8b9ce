use std::fmt;

/// Named scalar results of one model call, in the order the model reports them.
///
/// The first entry is the total loss unless an entry is named `"loss"`.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Metrics {
    entries: Vec<(String, f32)>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_loss(loss: f32) -> Self {
        Metrics::new().with("loss", loss)
    }

    pub fn with(mut self, name: impl Into<String>, value: f32) -> Self {
        self.push(name, value);
        self
    }

    /// Insert or overwrite `name`.
    pub fn push(&mut self, name: impl Into<String>, value: f32) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<f32> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    pub fn loss(&self) -> Option<f32> {
        self.get("loss")
            .or_else(|| self.entries.first().map(|(_, v)| *v))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Per-name mean over `history`, keeping the first entry's ordering.
    /// Names missing from some entries average over the entries that have them.
    pub fn mean(history: &[Metrics]) -> Metrics {
        let mut sums: Vec<(String, f64, usize)> = Vec::new();
        for metrics in history {
            for (name, value) in metrics.iter() {
                match sums.iter_mut().find(|(n, _, _)| n == name) {
                    Some(slot) => {
                        slot.1 += value as f64;
                        slot.2 += 1;
                    }
                    None => sums.push((name.to_string(), value as f64, 1)),
                }
            }
        }
        Metrics {
            entries: sums
                .into_iter()
                .map(|(name, sum, count)| (name, (sum / count as f64) as f32))
                .collect(),
        }
    }
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value:.4}")?;
        }
        Ok(())
    }
}
