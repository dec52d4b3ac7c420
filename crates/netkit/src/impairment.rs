//! Link shaping via `tc netem`.

/// Delay, loss and rate applied to one interface with a `netem` root qdisc.
///
/// All fields default to `None`. Omitted parameters are not passed to `tc`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Shaping {
    pub delay_ms: Option<u32>,
    pub jitter_ms: Option<u32>,
    pub loss_percent: Option<f32>,
    pub rate_kbit: Option<u64>,
}

impl Shaping {
    /// True if no parameter is set and shaping would be a no-op.
    pub fn is_empty(&self) -> bool {
        self.delay_ms.is_none() && self.loss_percent.is_none() && self.rate_kbit.is_none()
    }

    /// Build the netem parameter list.
    pub fn netem_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(delay) = self.delay_ms {
            args.push("delay".into());
            args.push(format!("{delay}ms"));
            if let Some(jitter) = self.jitter_ms
                && jitter > 0
            {
                args.push(format!("{jitter}ms"));
            }
        }

        if let Some(loss) = self.loss_percent {
            args.push("loss".into());
            args.push(format!("{loss}%"));
        }

        if let Some(rate) = self.rate_kbit {
            args.push("rate".into());
            args.push(format!("{rate}kbit"));
        }

        args
    }

    /// Full `tc` argument vector for `iface`.
    pub fn tc_args(&self, iface: &str) -> Vec<String> {
        let mut args: Vec<String> = ["tc", "qdisc", "replace", "dev", iface, "root", "netem"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(self.netem_args());
        args
    }
}
