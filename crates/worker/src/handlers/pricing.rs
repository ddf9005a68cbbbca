use taskhub_core::ModelPrice;

/// 内置价格表（美元 / 千token），按模型名前缀匹配
const BUILTIN_PRICES: &[(&str, f64, f64)] = &[
    ("o1", 0.015, 0.06),
    ("o3-mini", 0.0011, 0.0044),
    ("o3", 0.002, 0.008),
    ("o4-mini", 0.0011, 0.0044),
    ("gpt-4.1-nano", 0.0001, 0.0004),
    ("gpt-4.1-mini", 0.0004, 0.0016),
    ("gpt-4.1", 0.002, 0.008),
    ("gpt-4o-mini", 0.00015, 0.0006),
    ("gpt-4o", 0.0025, 0.01),
    ("gpt-4-turbo", 0.01, 0.03),
    ("gpt-4", 0.03, 0.06),
    ("gpt-3.5-turbo", 0.0005, 0.0015),
];

/// 供应商公布的模型价格
#[derive(Debug, Clone)]
pub struct PricingTable {
    prices: Vec<ModelPrice>,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            prices: BUILTIN_PRICES
                .iter()
                .map(|(model, input, output)| ModelPrice {
                    model: model.to_string(),
                    input_per_1k: *input,
                    output_per_1k: *output,
                })
                .collect(),
        }
    }
}

impl PricingTable {
    /// 配置中的条目覆盖同名内置条目
    pub fn with_overrides(overrides: &[ModelPrice]) -> Self {
        let mut table = Self::default();
        for price in overrides {
            table.prices.retain(|p| p.model != price.model);
            table.prices.push(price.clone());
        }
        table
    }

    /// 最长前缀匹配
    pub fn price(&self, model: &str) -> Option<&ModelPrice> {
        self.prices
            .iter()
            .filter(|p| model.starts_with(&p.model))
            .max_by_key(|p| p.model.len())
    }

    /// 未知模型返回 `None`；结果保留到百万分之一美元
    pub fn cost(&self, model: &str, tokens_in: u64, tokens_out: u64) -> Option<f64> {
        self.price(model).map(|p| {
            let raw = tokens_in as f64 / 1000.0 * p.input_per_1k
                + tokens_out as f64 / 1000.0 * p.output_per_1k;
            (raw * 1_000_000.0).round() / 1_000_000.0
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_prefix_wins() {
        let table = PricingTable::default();
        assert_eq!(table.price("gpt-4.1-mini-2025-04-14").unwrap().model, "gpt-4.1-mini");
        assert_eq!(table.price("o3-mini").unwrap().model, "o3-mini");
        assert_eq!(table.price("o3").unwrap().model, "o3");
        assert!(table.price("claude-3").is_none());
    }

    #[test]
    fn test_overrides_replace_builtin() {
        let table = PricingTable::with_overrides(&[ModelPrice {
            model: "o3".into(),
            input_per_1k: 0.0375,
            output_per_1k: 0.1,
        }]);
        assert_eq!(table.cost("o3", 40, 85), Some(0.01));
        assert_eq!(table.cost("unknown-model", 40, 85), None);
    }
}
