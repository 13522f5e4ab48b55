use std::collections::HashMap;

/// Immutable per-model parameters, loaded once from config.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelParams {
    /// Soft tokens-per-minute cap; crossing it makes a (key, model) unavailable.
    pub tpm_limit: u64,
    /// A 429 observed below this usage is treated as an upstream anomaly
    /// rather than a normal rate limit.
    pub recovery_threshold: u64,
    /// Default cooldown duration applied by `CooldownTable::disable`.
    pub disable_duration_secs: u64,
}

/// The fixed, ordered list of models (`M` in the design), plus their
/// parameters and the distinguished premium model.
#[derive(Debug, Clone)]
pub struct ModelTable {
    order: Vec<String>,
    params: HashMap<String, ModelParams>,
    premium: String,
    fallback_strategy: HashMap<String, Vec<String>>,
}

impl ModelTable {
    pub fn new(
        order: Vec<String>,
        params: HashMap<String, ModelParams>,
        premium: String,
        fallback_strategy: HashMap<String, Vec<String>>,
    ) -> Self {
        Self {
            order,
            params,
            premium,
            fallback_strategy,
        }
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn contains(&self, model: &str) -> bool {
        self.order.iter().any(|m| m == model)
    }

    pub fn is_premium(&self, model: &str) -> bool {
        model == self.premium
    }

    pub fn premium(&self) -> &str {
        &self.premium
    }

    pub fn params(&self, model: &str) -> ModelParams {
        self.params.get(model).cloned().unwrap_or(ModelParams {
            tpm_limit: u64::MAX,
            recovery_threshold: 0,
            disable_duration_secs: 300,
        })
    }

    /// Fallback chain `F` for `requested_model`, per the design:
    /// an explicit config chain wins; otherwise premium-first or
    /// non-premium-then-premium; `requested_model` is always forced to
    /// position 0.
    pub fn fallback_chain(&self, requested_model: &str) -> Vec<String> {
        let mut chain = self
            .fallback_strategy
            .get(requested_model)
            .cloned()
            .unwrap_or_default();

        if chain.is_empty() {
            if requested_model == self.premium {
                chain = self
                    .order
                    .iter()
                    .filter(|m| *m != requested_model)
                    .cloned()
                    .collect();
            } else {
                let mut non_premium: Vec<String> = self
                    .order
                    .iter()
                    .filter(|m| **m != self.premium && *m != requested_model)
                    .cloned()
                    .collect();
                non_premium.push(self.premium.clone());
                chain = non_premium;
            }
        }

        if let Some(pos) = chain.iter().position(|m| m == requested_model) {
            if pos != 0 {
                let model = chain.remove(pos);
                chain.insert(0, model);
            }
        } else {
            chain.insert(0, requested_model.to_string());
        }

        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ModelTable {
        let order = vec![
            "gemini-2.5-pro".to_string(),
            "gemini-2.5-flash".to_string(),
            "gemini-2.0-flash".to_string(),
        ];
        let mut params = HashMap::new();
        for m in &order {
            params.insert(
                m.clone(),
                ModelParams {
                    tpm_limit: 1000,
                    recovery_threshold: 100,
                    disable_duration_secs: 300,
                },
            );
        }
        ModelTable::new(order, params, "gemini-2.5-pro".to_string(), HashMap::new())
    }

    #[test]
    fn premium_fallback_is_rest_of_order() {
        let t = table();
        assert_eq!(
            t.fallback_chain("gemini-2.5-pro"),
            vec!["gemini-2.5-pro", "gemini-2.5-flash", "gemini-2.0-flash"]
        );
    }

    #[test]
    fn non_premium_fallback_ends_with_premium() {
        let t = table();
        assert_eq!(
            t.fallback_chain("gemini-2.5-flash"),
            vec!["gemini-2.5-flash", "gemini-2.0-flash", "gemini-2.5-pro"]
        );
    }

    #[test]
    fn explicit_chain_is_reordered_to_put_requested_first() {
        let mut table = table();
        table.fallback_strategy.insert(
            "gemini-2.0-flash".to_string(),
            vec!["gemini-2.5-pro".to_string(), "gemini-2.0-flash".to_string()],
        );
        assert_eq!(
            table.fallback_chain("gemini-2.0-flash"),
            vec!["gemini-2.0-flash", "gemini-2.5-pro"]
        );
    }
}
