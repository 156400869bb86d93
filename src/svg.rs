use anyhow::{Result, anyhow};
use std::collections::HashMap;
use std::fmt::Write;

use crate::utils::escape_xml;
use crate::*;

const UNBOUND_FILL: &str = "#ffffff";
const BOUND_FILL: &str = "#ebf8ff";
const NODE_STROKE: &str = "#2d3748";
const BOUND_STROKE: &str = "#3182ce";
const TEXT_COLOR: &str = "#1a202c";
const ENTITY_TEXT_COLOR: &str = "#2b6cb0";

/// Draws a rendered diagram as a standalone SVG document. Node positions
/// are the top-left corners produced by the layout.
pub fn render_svg(
    diagram: &RenderedDiagram,
    background: &str,
    options: &LayoutOptions,
) -> Result<String> {
    let width = diagram.size.width.max(options.margin * 2.0);
    let height = diagram.size.height.max(options.margin * 2.0);
    let positions: HashMap<&str, Point> = diagram
        .nodes
        .iter()
        .map(|node| (node.id.as_str(), node.position))
        .collect();

    let mut svg = String::new();
    write!(
        svg,
        r##"<?xml version="1.0" encoding="UTF-8"?>
<svg xmlns="http://www.w3.org/2000/svg" width="{:.0}" height="{:.0}" viewBox="0 0 {:.0} {:.0}" font-family="Inter, system-ui, sans-serif">
  <defs>
    <marker id="arrow-end" markerWidth="8" markerHeight="8" refX="6" refY="4" orient="auto" markerUnits="strokeWidth">
      <path d="M1,1 L6,4 L1,7 z" fill="context-stroke" />
    </marker>
  </defs>
  <rect width="100%" height="100%" fill="{}" />
  <title>{}</title>
"##,
        width,
        height,
        width,
        height,
        escape_xml(background),
        escape_xml(&diagram.name)
    )?;

    for edge in &diagram.edges {
        let source = positions
            .get(edge.source.as_str())
            .ok_or_else(|| anyhow!("edge '{}' starts at unknown node '{}'", edge.id, edge.source))?;
        let target = positions
            .get(edge.target.as_str())
            .ok_or_else(|| anyhow!("edge '{}' ends at unknown node '{}'", edge.id, edge.target))?;
        let (start, end) = anchors(diagram.direction, *source, *target, options);
        let dash_attr = if edge.animated {
            " stroke-dasharray=\"8 6\""
        } else {
            ""
        };
        write!(
            svg,
            "  <line x1=\"{:.1}\" y1=\"{:.1}\" x2=\"{:.1}\" y2=\"{:.1}\" stroke=\"{}\" stroke-width=\"2\" marker-end=\"url(#arrow-end)\"{} />\n",
            start.x, start.y, end.x, end.y, NODE_STROKE, dash_attr
        )?;
    }

    for node in &diagram.nodes {
        let (fill, stroke) = if node.entity_label.is_some() {
            (BOUND_FILL, BOUND_STROKE)
        } else {
            (UNBOUND_FILL, NODE_STROKE)
        };
        write!(
            svg,
            "  <rect x=\"{:.1}\" y=\"{:.1}\" width=\"{:.1}\" height=\"{:.1}\" rx=\"8\" ry=\"8\" fill=\"{}\" stroke=\"{}\" stroke-width=\"2\" />\n",
            node.position.x, node.position.y, options.node_width, options.node_height, fill, stroke
        )?;

        let center_x = node.position.x + options.node_width / 2.0;
        let center_y = node.position.y + options.node_height / 2.0;
        match &node.entity_label {
            Some(entity) => {
                write!(
                    svg,
                    "  <text x=\"{:.1}\" y=\"{:.1}\" fill=\"{}\" font-size=\"14\" text-anchor=\"middle\" dominant-baseline=\"middle\">{}</text>\n",
                    center_x,
                    center_y - 9.0,
                    TEXT_COLOR,
                    escape_xml(&node.label)
                )?;
                write!(
                    svg,
                    "  <text x=\"{:.1}\" y=\"{:.1}\" fill=\"{}\" font-size=\"12\" text-anchor=\"middle\" dominant-baseline=\"middle\">{}</text>\n",
                    center_x,
                    center_y + 10.0,
                    ENTITY_TEXT_COLOR,
                    escape_xml(entity)
                )?;
            }
            None => write!(
                svg,
                "  <text x=\"{:.1}\" y=\"{:.1}\" fill=\"{}\" font-size=\"14\" text-anchor=\"middle\" dominant-baseline=\"middle\">{}</text>\n",
                center_x,
                center_y,
                TEXT_COLOR,
                escape_xml(&node.label)
            )?,
        }
    }

    svg.push_str("</svg>\n");
    Ok(svg)
}

fn anchors(
    direction: LayoutDirection,
    source: Point,
    target: Point,
    options: &LayoutOptions,
) -> (Point, Point) {
    let w = options.node_width;
    let h = options.node_height;
    match direction {
        LayoutDirection::TopDown => (
            Point::new(source.x + w / 2.0, source.y + h),
            Point::new(target.x + w / 2.0, target.y),
        ),
        LayoutDirection::LeftRight => (
            Point::new(source.x + w, source.y + h / 2.0),
            Point::new(target.x, target.y + h / 2.0),
        ),
        LayoutDirection::Grid => (
            Point::new(source.x + w / 2.0, source.y + h / 2.0),
            Point::new(target.x + w / 2.0, target.y + h / 2.0),
        ),
    }
}
