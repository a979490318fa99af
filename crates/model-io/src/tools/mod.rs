//! Tools offered to the model by the agent demo.

mod stock;
mod weather;

pub use stock::StockPriceTool;
pub use weather::{WEATHER_ENDPOINT, WeatherTool};
