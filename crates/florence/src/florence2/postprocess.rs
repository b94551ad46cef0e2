//! Turns the raw decoded text into a task-specific structured answer.
//!
//! Coordinates are emitted as `<loc_N>` tokens, bins 0..999 over the original
//! image, alternating x and y.

use super::task::{AnswerKind, Task};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

pub const NUM_LOCATION_BINS: u32 = 1000;

const STRIPPED_TOKENS: [&str; 3] = ["<s>", "</s>", "<pad>"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TaskAnswer {
    Text(String),
    Ocr {
        quad_boxes: Vec<[f32; 8]>,
        labels: Vec<String>,
    },
    Bboxes {
        bboxes: Vec<[f32; 4]>,
        labels: Vec<String>,
    },
    Polygons {
        polygons: Vec<Vec<Vec<f32>>>,
        labels: Vec<String>,
    },
    BboxesOrPolygons {
        bboxes: Vec<[f32; 4]>,
        bboxes_labels: Vec<String>,
        polygons: Vec<Vec<Vec<f32>>>,
        polygons_labels: Vec<String>,
    },
}

impl TaskAnswer {
    /// `{"<TASK>": answer}`
    pub fn to_json(&self, task: Task) -> anyhow::Result<Value> {
        let mut map = Map::new();
        map.insert(task.to_string(), serde_json::to_value(self)?);
        Ok(Value::Object(map))
    }
}

pub fn clean_text(text: &str) -> String {
    STRIPPED_TOKENS
        .iter()
        .fold(text.to_string(), |text, token| text.replace(token, ""))
}

fn dequantize(bin: u32, size: u32) -> f32 {
    (bin.min(NUM_LOCATION_BINS - 1) as f32 + 0.5) * size as f32 / NUM_LOCATION_BINS as f32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Piece<'a> {
    Text(&'a str),
    Loc(u32),
    Sep,
    PolyStart,
    PolyEnd,
}

impl Piece<'_> {
    fn is_polygon_markup(&self) -> bool {
        matches!(self, Piece::Sep | Piece::PolyStart | Piece::PolyEnd)
    }
}

/// A label followed by the location markup that belongs to it.
#[derive(Debug, Default)]
struct Instance<'a> {
    label: String,
    marks: Vec<Piece<'a>>,
}

impl Instance<'_> {
    fn locs(&self) -> impl Iterator<Item = u32> + '_ {
        self.marks.iter().filter_map(|p| match p {
            Piece::Loc(bin) => Some(*bin),
            _ => None,
        })
    }

    fn coords(&self, bins: &[u32], size: ImageSize) -> Vec<f32> {
        bins.iter()
            .enumerate()
            .map(|(idx, &bin)| {
                if idx % 2 == 0 {
                    dequantize(bin, size.width)
                } else {
                    dequantize(bin, size.height)
                }
            })
            .collect()
    }

    fn boxes<const N: usize>(&self, size: ImageSize) -> Vec<[f32; N]> {
        let bins: Vec<u32> = self.locs().collect();
        bins.chunks_exact(N)
            .filter_map(|chunk| self.coords(chunk, size).try_into().ok())
            .collect()
    }

    /// Polygons are separated by `<sep>` or wrapped in `<poly>..</poly>`.
    /// An odd trailing coordinate is dropped, as are polygons under 3 points.
    fn polygons(&self, size: ImageSize) -> Vec<Vec<f32>> {
        self.marks
            .split(|p| p.is_polygon_markup())
            .filter_map(|group| {
                let mut bins: Vec<u32> = group
                    .iter()
                    .filter_map(|p| match p {
                        Piece::Loc(bin) => Some(*bin),
                        _ => None,
                    })
                    .collect();
                bins.truncate(bins.len() - bins.len() % 2);
                (bins.len() >= 6).then(|| self.coords(&bins, size))
            })
            .collect()
    }
}

struct Lexer {
    markup: Regex,
}

impl Lexer {
    fn new() -> anyhow::Result<Self> {
        Ok(Self {
            markup: Regex::new(r"<loc_(\d+)>|<sep>|<poly>|</poly>")?,
        })
    }

    fn pieces<'a>(&self, text: &'a str) -> Vec<Piece<'a>> {
        let mut pieces = vec![];
        let mut last = 0;

        for caps in self.markup.captures_iter(text) {
            let Some(m) = caps.get(0) else { continue };
            if m.start() > last {
                pieces.push(Piece::Text(&text[last..m.start()]));
            }
            last = m.end();

            let piece = match (m.as_str(), caps.get(1)) {
                (_, Some(bin)) => match bin.as_str().parse() {
                    Ok(bin) => Piece::Loc(bin),
                    Err(_) => Piece::Loc(NUM_LOCATION_BINS - 1),
                },
                ("<sep>", _) => Piece::Sep,
                ("<poly>", _) => Piece::PolyStart,
                _ => Piece::PolyEnd,
            };
            pieces.push(piece);
        }

        if last < text.len() {
            pieces.push(Piece::Text(&text[last..]));
        }
        pieces
    }

    /// Trailing text without any location is dropped.
    fn instances<'a>(&self, text: &'a str) -> Vec<Instance<'a>> {
        let mut instances = vec![];
        let mut current = Instance::default();

        for piece in self.pieces(text) {
            match piece {
                Piece::Text(text) => {
                    if !current.marks.is_empty() {
                        instances.push(std::mem::take(&mut current));
                    }
                    current.label.push_str(text);
                }
                mark => current.marks.push(mark),
            }
        }
        if !current.marks.is_empty() {
            instances.push(current);
        }

        instances
    }
}

pub fn post_process(text: &str, task: Task, image_size: ImageSize) -> anyhow::Result<TaskAnswer> {
    let text = clean_text(text);
    let lexer = Lexer::new()?;

    let answer = match task.answer_kind() {
        AnswerKind::PureText => TaskAnswer::Text(text.trim().to_string()),
        AnswerKind::Ocr => {
            let mut quad_boxes = vec![];
            let mut labels = vec![];
            for instance in lexer.instances(&text) {
                for quad_box in instance.boxes::<8>(image_size) {
                    quad_boxes.push(quad_box);
                    labels.push(instance.label.trim().to_string());
                }
            }
            TaskAnswer::Ocr { quad_boxes, labels }
        }
        AnswerKind::DescriptionWithBboxes { allow_empty_label } => {
            bboxes_answer(&lexer, &text, image_size, allow_empty_label)
        }
        AnswerKind::PhraseGrounding => bboxes_answer(&lexer, &text, image_size, false),
        AnswerKind::Polygons => {
            let mut polygons = vec![];
            let mut labels = vec![];
            for instance in lexer.instances(&text) {
                let instance_polygons = instance.polygons(image_size);
                if !instance_polygons.is_empty() {
                    polygons.push(instance_polygons);
                    labels.push(instance.label.trim().to_string());
                }
            }
            TaskAnswer::Polygons { polygons, labels }
        }
        AnswerKind::BboxesOrPolygons => {
            let mut bboxes = vec![];
            let mut bboxes_labels = vec![];
            let mut polygons = vec![];
            let mut polygons_labels = vec![];

            for instance in lexer.instances(&text) {
                let label = instance.label.trim().to_string();
                let is_bbox = instance.locs().count() == 4
                    && !instance.marks.iter().any(|p| p.is_polygon_markup());

                if is_bbox {
                    bboxes.extend(instance.boxes::<4>(image_size));
                    bboxes_labels.push(label);
                } else {
                    let instance_polygons = instance.polygons(image_size);
                    if !instance_polygons.is_empty() {
                        polygons.push(instance_polygons);
                        polygons_labels.push(label);
                    }
                }
            }

            TaskAnswer::BboxesOrPolygons {
                bboxes,
                bboxes_labels,
                polygons,
                polygons_labels,
            }
        }
    };

    Ok(answer)
}

fn bboxes_answer(
    lexer: &Lexer,
    text: &str,
    image_size: ImageSize,
    allow_empty_label: bool,
) -> TaskAnswer {
    let mut bboxes = vec![];
    let mut labels = vec![];

    for instance in lexer.instances(text) {
        let label = instance.label.trim();
        if label.is_empty() && !allow_empty_label {
            continue;
        }
        for bbox in instance.boxes::<4>(image_size) {
            bboxes.push(bbox);
            labels.push(label.to_string());
        }
    }

    TaskAnswer::Bboxes { bboxes, labels }
}
