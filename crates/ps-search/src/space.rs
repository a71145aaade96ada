//! Search space definitions.
//!
//! A search space is a JSON configuration template in which some values are
//! variation points:
//!
//! - `{"search_choice": [a, b, ...]}` selects one alternative. An alternative
//!   may contain variation points of its own (a configurable stage).
//! - `{"search_range": [low, high]}` selects an integer in `low..=high`.
//!
//! Every combination has a position in grid order: object fields are walked in
//! key order, array items in index order, and the last variation point varies
//! fastest. [`SearchSpace::resolve`] maps a position back to a configuration
//! without enumerating the space.

use ps_types::ConfigError;
use serde_json::{Map, Value};

/// Key marking an enumerated variation point.
pub const CHOICE_KEY: &str = "search_choice";
/// Key marking an inclusive integer range.
pub const RANGE_KEY: &str = "search_range";

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Fixed(Value),
    Object { fields: Vec<(String, Node)>, size: usize },
    Array { items: Vec<Node>, size: usize },
    Choice { alternatives: Vec<Node>, size: usize },
    IntRange { low: i64, size: usize },
}

impl Node {
    fn size(&self) -> usize {
        match self {
            Node::Fixed(_) => 1,
            Node::Object { size, .. }
            | Node::Array { size, .. }
            | Node::Choice { size, .. }
            | Node::IntRange { size, .. } => *size,
        }
    }

    fn is_fixed(&self) -> bool {
        matches!(self, Node::Fixed(_))
    }

    /// Whether some combination of this node resolves to `value`.
    fn can_produce(&self, value: &Value) -> bool {
        match self {
            Node::Fixed(fixed) => fixed == value,
            Node::Choice { alternatives, .. } => {
                alternatives.iter().any(|node| node.can_produce(value))
            }
            Node::IntRange { low, size } => value.as_i64().is_some_and(|n| {
                let offset = i128::from(n) - i128::from(*low);
                offset >= 0 && offset < *size as i128
            }),
            Node::Object { fields, .. } => value.as_object().is_some_and(|map| {
                map.len() == fields.len()
                    && fields
                        .iter()
                        .all(|(key, node)| map.get(key).is_some_and(|v| node.can_produce(v)))
            }),
            Node::Array { items, .. } => value.as_array().is_some_and(|values| {
                values.len() == items.len()
                    && items.iter().zip(values).all(|(node, v)| node.can_produce(v))
            }),
        }
    }

    /// Whether the two nodes share at least one resolved value.
    fn overlaps(&self, other: &Node) -> bool {
        match (self, other) {
            (Node::Fixed(value), node) | (node, Node::Fixed(value)) => node.can_produce(value),
            (Node::Choice { alternatives, .. }, node)
            | (node, Node::Choice { alternatives, .. }) => {
                alternatives.iter().any(|alternative| alternative.overlaps(node))
            }
            (Node::IntRange { low: a, size: m }, Node::IntRange { low: b, size: n }) => {
                let end = |low: i64, size: usize| i128::from(low) + size as i128;
                i128::from(*a) < end(*b, *n) && i128::from(*b) < end(*a, *m)
            }
            (Node::Object { fields: a, .. }, Node::Object { fields: b, .. }) => {
                a.len() == b.len()
                    && a.iter().all(|(key, node)| {
                        b.iter()
                            .find(|(other, _)| other == key)
                            .is_some_and(|(_, other)| node.overlaps(other))
                    })
            }
            (Node::Array { items: a, .. }, Node::Array { items: b, .. }) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.overlaps(y))
            }
            _ => false,
        }
    }

    fn resolve(&self, mut position: usize) -> Option<Value> {
        match self {
            Node::Fixed(value) => Some(value.clone()),
            Node::Object { fields, .. } => {
                let picks = mixed_radix(fields.iter().map(|(_, node)| node), position);
                let mut map = Map::new();
                for ((key, node), pick) in fields.iter().zip(picks) {
                    map.insert(key.clone(), node.resolve(pick)?);
                }
                Some(Value::Object(map))
            }
            Node::Array { items, .. } => {
                let picks = mixed_radix(items.iter(), position);
                items
                    .iter()
                    .zip(picks)
                    .map(|(node, pick)| node.resolve(pick))
                    .collect::<Option<Vec<_>>>()
                    .map(Value::Array)
            }
            Node::Choice { alternatives, .. } => {
                for alternative in alternatives {
                    let size = alternative.size();
                    if position < size {
                        return alternative.resolve(position);
                    }
                    position -= size;
                }
                None
            }
            Node::IntRange { low, size } => {
                if position >= *size {
                    return None;
                }
                let offset = i64::try_from(position).ok()?;
                Some(Value::from(low + offset))
            }
        }
    }
}

/// Split `position` into one digit per child, last child least significant.
fn mixed_radix<'a>(
    children: impl DoubleEndedIterator<Item = &'a Node>,
    mut position: usize,
) -> Vec<usize> {
    let mut picks: Vec<usize> = children
        .rev()
        .map(|node| {
            let size = node.size();
            let pick = position % size;
            position /= size;
            pick
        })
        .collect();
    picks.reverse();
    picks
}

/// A parsed configuration template with its variation points.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchSpace {
    template: Value,
    root: Node,
    variation_points: usize,
}

impl SearchSpace {
    /// Parse a template, rejecting malformed or empty variation points.
    pub fn parse(template: &Value) -> Result<Self, ConfigError> {
        let mut variation_points = 0;
        let root = parse_node(template, "", &mut variation_points)?;
        Ok(Self {
            template: template.clone(),
            root,
            variation_points,
        })
    }

    pub fn template(&self) -> &Value {
        &self.template
    }

    /// Number of distinct combinations.
    pub fn size(&self) -> usize {
        self.root.size()
    }

    /// Number of variation points, nested ones included.
    pub fn variation_points(&self) -> usize {
        self.variation_points
    }

    /// Whether the template has no variation at all.
    pub fn is_fixed(&self) -> bool {
        self.root.is_fixed()
    }

    /// Resolve the combination at `position` in grid order.
    pub fn resolve(&self, position: usize) -> Option<Value> {
        if position >= self.size() {
            return None;
        }
        self.root.resolve(position)
    }
}

fn pointer_segment(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

fn too_large(path: &str) -> ConfigError {
    ConfigError::SearchSpace {
        path: display_path(path),
        message: "the number of combinations overflows; split the experiment".to_string(),
    }
}

fn parse_node(value: &Value, path: &str, points: &mut usize) -> Result<Node, ConfigError> {
    match value {
        Value::Object(map) if map.contains_key(CHOICE_KEY) || map.contains_key(RANGE_KEY) => {
            *points += 1;
            parse_variation(map, path, points)
        }
        Value::Object(map) => {
            let mut fields = Vec::with_capacity(map.len());
            let mut size: usize = 1;
            for (key, child) in map {
                let node = parse_node(child, &format!("{path}/{}", pointer_segment(key)), points)?;
                size = size.checked_mul(node.size()).ok_or_else(|| too_large(path))?;
                fields.push((key.clone(), node));
            }
            if fields.iter().all(|(_, node)| node.is_fixed()) {
                Ok(Node::Fixed(value.clone()))
            } else {
                Ok(Node::Object { fields, size })
            }
        }
        Value::Array(values) => {
            let mut items = Vec::with_capacity(values.len());
            let mut size: usize = 1;
            for (i, child) in values.iter().enumerate() {
                let node = parse_node(child, &format!("{path}/{i}"), points)?;
                size = size.checked_mul(node.size()).ok_or_else(|| too_large(path))?;
                items.push(node);
            }
            if items.iter().all(Node::is_fixed) {
                Ok(Node::Fixed(value.clone()))
            } else {
                Ok(Node::Array { items, size })
            }
        }
        other => Ok(Node::Fixed(other.clone())),
    }
}

fn parse_variation(
    map: &Map<String, Value>,
    path: &str,
    points: &mut usize,
) -> Result<Node, ConfigError> {
    if map.len() != 1 {
        let extra: Vec<&str> = map
            .keys()
            .filter(|k| *k != CHOICE_KEY && *k != RANGE_KEY)
            .map(String::as_str)
            .collect();
        return Err(ConfigError::SearchSpace {
            path: display_path(path),
            message: format!(
                "a variation point must be the only key of its object, found {:?} alongside it",
                extra
            ),
        });
    }

    if let Some(choices) = map.get(CHOICE_KEY) {
        let Value::Array(choices) = choices else {
            return Err(ConfigError::SearchSpace {
                path: display_path(path),
                message: format!("'{CHOICE_KEY}' expects a list of alternatives, found {choices}"),
            });
        };
        if choices.is_empty() {
            return Err(ConfigError::EmptyChoice {
                path: display_path(path),
            });
        }

        let mut alternatives: Vec<Node> = Vec::with_capacity(choices.len());
        let mut size: usize = 0;
        for (i, choice) in choices.iter().enumerate() {
            let node = parse_node(choice, &format!("{path}/{CHOICE_KEY}/{i}"), points)?;
            // Overlapping alternatives would yield the same configuration twice
            if let Some(j) = alternatives.iter().position(|other| other.overlaps(&node)) {
                let message = if node.is_fixed() && alternatives[j].is_fixed() {
                    format!("alternative {choice} is listed more than once")
                } else {
                    format!("alternatives {j} and {i} can resolve to the same value")
                };
                return Err(ConfigError::SearchSpace {
                    path: display_path(path),
                    message,
                });
            }
            size = size.checked_add(node.size()).ok_or_else(|| too_large(path))?;
            alternatives.push(node);
        }
        return Ok(Node::Choice { alternatives, size });
    }

    let bounds = &map[RANGE_KEY];
    let parsed = bounds
        .as_array()
        .filter(|b| b.len() == 2)
        .and_then(|b| Some((b[0].as_i64()?, b[1].as_i64()?)));
    match parsed {
        Some((low, high)) if low <= high => {
            let size = usize::try_from(i128::from(high) - i128::from(low) + 1)
                .map_err(|_| too_large(path))?;
            Ok(Node::IntRange { low, size })
        }
        Some((low, high)) => Err(ConfigError::SearchSpace {
            path: display_path(path),
            message: format!("'{RANGE_KEY}' bounds are reversed: {low} > {high}"),
        }),
        None => Err(ConfigError::SearchSpace {
            path: display_path(path),
            message: format!("'{RANGE_KEY}' expects [low, high] integers, found {bounds}"),
        }),
    }
}
