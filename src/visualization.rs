//! Plotly figure builders.
//!
//! Each function returns a `{"data": [...], "layout": {...}}` figure object
//! that any Plotly front-end can render directly. Nothing is rendered here.

use serde::Serialize;
use serde_json::{Value, json};

const TEMPLATE: &str = "plotly_dark";

/// One time-series sample. `timestamp` is whatever the upstream API returns
/// (unix seconds or an ISO date string).
#[derive(Debug, Clone, Serialize)]
pub struct SeriesPoint {
    pub timestamp: Value,
    pub value: f64,
}

#[derive(Debug, Clone)]
pub struct Series {
    pub name: String,
    pub points: Vec<SeriesPoint>,
}

#[derive(Debug, Clone)]
pub struct VolumePoint {
    pub timestamp: Value,
    pub price: f64,
    pub volume: f64,
}

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub x: f64,
    pub y: f64,
    pub label: String,
    pub color: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GraphEdge {
    pub source_x: f64,
    pub source_y: f64,
    pub target_x: f64,
    pub target_y: f64,
}

fn line_trace(name: &str, points: &[SeriesPoint]) -> Value {
    json!({
        "type": "scatter",
        "mode": "lines",
        "name": name,
        "x": points.iter().map(|p| p.timestamp.clone()).collect::<Vec<_>>(),
        "y": points.iter().map(|p| p.value).collect::<Vec<_>>(),
    })
}

fn figure(data: Vec<Value>, layout: Value) -> Value {
    let mut layout = layout;
    layout["template"] = json!(TEMPLATE);
    json!({ "data": data, "layout": layout })
}

pub fn price_chart(points: &[SeriesPoint], title: &str) -> Value {
    figure(
        vec![line_trace("Price", points)],
        json!({ "title": title, "xaxis": { "title": "Date" }, "yaxis": { "title": "Price" } }),
    )
}

/// Donut chart of holdings, in the order given.
pub fn token_distribution(holdings: &[(String, f64)], title: &str) -> Value {
    figure(
        vec![json!({
            "type": "pie",
            "labels": holdings.iter().map(|(l, _)| l).collect::<Vec<_>>(),
            "values": holdings.iter().map(|(_, v)| v).collect::<Vec<_>>(),
            "hole": 0.3,
        })],
        json!({ "title": title }),
    )
}

/// One line per series; pass a single series named `TVL` for a plain chart.
pub fn tvl_chart(series: &[Series], title: &str) -> Value {
    figure(
        series.iter().map(|s| line_trace(&s.name, &s.points)).collect(),
        json!({ "title": title, "xaxis": { "title": "Date" }, "yaxis": { "title": "TVL" } }),
    )
}

pub fn network_graph(nodes: &[GraphNode], edges: &[GraphEdge], title: &str) -> Value {
    // Edges are drawn as one polyline broken by nulls.
    let edge_x: Vec<Value> = edges
        .iter()
        .flat_map(|e| [json!(e.source_x), json!(e.target_x), Value::Null])
        .collect();
    let edge_y: Vec<Value> = edges
        .iter()
        .flat_map(|e| [json!(e.source_y), json!(e.target_y), Value::Null])
        .collect();
    let edge_trace = json!({
        "type": "scatter",
        "mode": "lines",
        "x": edge_x,
        "y": edge_y,
        "line": { "width": 0.5, "color": "#888" },
    });
    let node_trace = json!({
        "type": "scatter",
        "mode": "markers+text",
        "x": nodes.iter().map(|n| n.x).collect::<Vec<_>>(),
        "y": nodes.iter().map(|n| n.y).collect::<Vec<_>>(),
        "text": nodes.iter().map(|n| n.label.as_str()).collect::<Vec<_>>(),
        "marker": {
            "size": 10,
            "color": nodes.iter().map(|n| n.color.as_deref().unwrap_or("#888")).collect::<Vec<_>>(),
        },
    });
    figure(
        vec![edge_trace, node_trace],
        json!({
            "title": title,
            "showlegend": false,
            "hovermode": "closest",
            "margin": { "b": 20, "l": 5, "r": 5, "t": 40 },
        }),
    )
}

/// Price line on top, volume bars underneath, sharing the x axis.
pub fn volume_analysis(points: &[VolumePoint], title: &str) -> Value {
    let x: Vec<Value> = points.iter().map(|p| p.timestamp.clone()).collect();
    figure(
        vec![
            json!({
                "type": "scatter",
                "mode": "lines",
                "name": "Price",
                "x": x,
                "y": points.iter().map(|p| p.price).collect::<Vec<_>>(),
                "xaxis": "x",
                "yaxis": "y",
            }),
            json!({
                "type": "bar",
                "name": "Volume",
                "x": x,
                "y": points.iter().map(|p| p.volume).collect::<Vec<_>>(),
                "xaxis": "x2",
                "yaxis": "y2",
            }),
        ],
        json!({
            "height": 600,
            "xaxis": { "anchor": "y", "domain": [0.0, 1.0], "matches": "x2", "showticklabels": false },
            "xaxis2": { "anchor": "y2", "domain": [0.0, 1.0] },
            "yaxis": { "anchor": "x", "domain": [0.515, 1.0] },
            "yaxis2": { "anchor": "x2", "domain": [0.0, 0.485] },
            "annotations": [
                { "text": title, "showarrow": false, "xref": "paper", "yref": "paper", "x": 0.5, "y": 1.0 },
                { "text": "Volume", "showarrow": false, "xref": "paper", "yref": "paper", "x": 0.5, "y": 0.485 },
            ],
        }),
    )
}

pub fn heatmap(z: &[Vec<f64>], x_labels: &[String], y_labels: &[String], title: &str) -> Value {
    figure(
        vec![json!({
            "type": "heatmap",
            "z": z,
            "x": x_labels,
            "y": y_labels,
            "colorscale": "Viridis",
        })],
        json!({ "title": title }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points() -> Vec<SeriesPoint> {
        vec![
            SeriesPoint { timestamp: json!(1_700_000_000), value: 1.0 },
            SeriesPoint { timestamp: json!(1_700_086_400), value: 2.5 },
        ]
    }

    #[test]
    fn price_chart_has_one_dark_line() {
        let fig = price_chart(&points(), "ETH");
        assert_eq!(fig["data"].as_array().unwrap().len(), 1);
        assert_eq!(fig["data"][0]["y"], json!([1.0, 2.5]));
        assert_eq!(fig["layout"]["template"], TEMPLATE);
        assert_eq!(fig["layout"]["title"], "ETH");
    }

    #[test]
    fn distribution_is_a_donut() {
        let fig = token_distribution(&[("ETH".into(), 2.0), ("USDC".into(), 100.0)], "Holdings");
        assert_eq!(fig["data"][0]["type"], "pie");
        assert_eq!(fig["data"][0]["hole"], 0.3);
        assert_eq!(fig["data"][0]["labels"], json!(["ETH", "USDC"]));
    }

    #[test]
    fn tvl_chart_one_trace_per_series() {
        let series = [
            Series { name: "aave".into(), points: points() },
            Series { name: "uniswap".into(), points: points() },
        ];
        let fig = tvl_chart(&series, "TVL");
        assert_eq!(fig["data"].as_array().unwrap().len(), 2);
        assert_eq!(fig["data"][1]["name"], "uniswap");
    }

    #[test]
    fn network_edges_are_null_separated() {
        let nodes = [
            GraphNode { x: 0.0, y: 0.0, label: "a".into(), color: None },
            GraphNode { x: 1.0, y: 1.0, label: "b".into(), color: Some("#f00".into()) },
        ];
        let edges = [GraphEdge { source_x: 0.0, source_y: 0.0, target_x: 1.0, target_y: 1.0 }];
        let fig = network_graph(&nodes, &edges, "Flows");
        assert_eq!(fig["data"][0]["x"], json!([0.0, 1.0, null]));
        assert_eq!(fig["data"][1]["marker"]["color"], json!(["#888", "#f00"]));
    }

    #[test]
    fn volume_analysis_uses_two_rows() {
        let pts = [VolumePoint { timestamp: json!("2024-01-01"), price: 10.0, volume: 3.0 }];
        let fig = volume_analysis(&pts, "Sales");
        assert_eq!(fig["data"][1]["type"], "bar");
        assert_eq!(fig["data"][1]["yaxis"], "y2");
        assert_eq!(fig["layout"]["height"], 600);
    }

    #[test]
    fn heatmap_uses_viridis() {
        let fig = heatmap(&[vec![1.0, 2.0]], &["a".into(), "b".into()], &["row".into()], "H");
        assert_eq!(fig["data"][0]["colorscale"], "Viridis");
    }
}
