use std::future::ready;

use model_io_core::tool::{Error as ToolError, Tool, ToolResult, ToolSpec};
use schemars::JsonSchema;
use serde::Deserialize;

/// Arguments of [`StockPriceTool`].
#[derive(Deserialize, JsonSchema)]
pub struct StockPriceParameters {
    #[schemars(description = "股票代码，比如 600519。")]
    stock_code: String,
}

/// Quotes a stock price. The quote is fixed, this tool only exists to
/// give the model a second function to choose from.
pub struct StockPriceTool {
    spec: ToolSpec,
}

impl StockPriceTool {
    /// Creates the tool.
    pub fn new() -> Result<Self, ToolError> {
        Ok(Self {
            spec: ToolSpec::for_input::<StockPriceParameters>(
                "get_stock_price",
                "获取指定股票的实时价格。",
            )?,
        })
    }
}

impl Tool for StockPriceTool {
    type Input = StockPriceParameters;

    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn execute(
        &self,
        input: StockPriceParameters,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        ready(Ok(format!("股票 {} 的实时价格是 10.00", input.stock_code)))
    }
}

#[cfg(test)]
mod tests {
    use model_io_core::ToolRegistry;
    use model_io_model::ToolCallRequest;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_quote() {
        let registry = ToolRegistry::new()
            .with_tool(StockPriceTool::new().unwrap())
            .unwrap();
        let definition = &registry.definitions()[0];
        assert_eq!(definition.parameters["required"], json!(["stock_code"]));

        let quote = registry
            .call(&ToolCallRequest {
                id: "call_1".to_owned(),
                name: "get_stock_price".to_owned(),
                arguments: json!({ "stock_code": "600519" }),
            })
            .await
            .unwrap();
        assert_eq!(quote, "股票 600519 的实时价格是 10.00");
    }
}
