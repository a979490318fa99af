use model_io_core::tool::{Error as ToolError, Tool, ToolResult, ToolSpec};
use reqwest::{Client, Url, header};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

/// The one-day forecast endpoint of the weather market API.
pub const WEATHER_ENDPOINT: &str =
    "https://getweather.market.alicloudapi.com/lundear/weather1d";

/// Arguments of [`WeatherTool`].
#[derive(Deserialize, JsonSchema)]
pub struct WeatherParameters {
    #[serde(rename = "areaCn")]
    #[schemars(description = "城市或县区的名称，比如北京。")]
    area_cn: String,
}

/// Looks up today's weather of a city.
///
/// The JSON body of the weather service is handed to the model as is.
pub struct WeatherTool {
    spec: ToolSpec,
    client: Client,
    endpoint: String,
    app_code: String,
}

impl WeatherTool {
    /// Creates the tool with the `APPCODE` of the weather service.
    pub fn new<S: Into<String>>(app_code: S) -> Result<Self, ToolError> {
        Ok(Self {
            spec: ToolSpec::for_input::<WeatherParameters>(
                "get_current_weather",
                "获取指定城市的天气信息。当你想查询指定城市的天气时非常有用。",
            )?,
            client: Client::new(),
            endpoint: WEATHER_ENDPOINT.to_owned(),
            app_code: app_code.into(),
        })
    }

    /// Sends requests to another endpoint.
    #[inline]
    pub fn with_endpoint<S: Into<String>>(mut self, endpoint: S) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

impl Tool for WeatherTool {
    type Input = WeatherParameters;

    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn execute(
        &self,
        input: WeatherParameters,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let authorization = format!("APPCODE {}", self.app_code);
        async move {
            let url = Url::parse_with_params(&endpoint, [("areaCn", &input.area_cn)])
                .map_err(|err| execution_failed(format!("invalid endpoint: {err}")))?;
            debug!("querying weather of {}", input.area_cn);

            let resp = client
                .get(url)
                .header(header::AUTHORIZATION, authorization)
                .send()
                .await
                .map_err(|err| execution_failed(format!("weather request failed: {err}")))?;
            let status = resp.status();
            let body = resp
                .text()
                .await
                .map_err(|err| execution_failed(format!("failed to read weather: {err}")))?;
            if !status.is_success() {
                return Err(execution_failed(format!(
                    "weather service returned {status}: {body}"
                )));
            }

            let data: Value = serde_json::from_str(&body).map_err(|err| {
                execution_failed(format!("weather service returned non-JSON body: {err}"))
            })?;
            Ok(data.to_string())
        }
    }
}

#[inline]
fn execution_failed(reason: String) -> ToolError {
    ToolError::execution_failed().with_reason(reason)
}
