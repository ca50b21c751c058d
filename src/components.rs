//! Component records of the NOODLES scene graph.
//!
//! Field names match the NOODLES message spec exactly; optional fields are
//! omitted from the wire when unset. References between components are typed
//! IDs, never pointers, so the reference graph is a DAG by construction.

use serde::{Deserialize, Serialize};
use serde_cbor::Value;
use thiserror::Error;

use crate::ids::{
    BufferId, BufferViewId, ComponentId, ComponentKind, EntityId, GeometryId, ImageId, LightId,
    MaterialId, MethodId, PlotId, SamplerId, SignalId, TableId, TextureId,
};

pub type Vec3 = [f64; 3];
pub type Vec4 = [f64; 4];
pub type Mat3 = [f64; 9];
pub type Mat4 = [f64; 16];
pub type Rgb = Vec3;
pub type Rgba = Vec4;

/// Validation failure for a component payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{kind}: exactly one of {fields} must be set")]
    OneOf {
        kind: ComponentKind,
        fields: &'static str,
    },
    #[error("{kind}: non-finite value in {field}")]
    NonFinite {
        kind: ComponentKind,
        field: &'static str,
    },
}

/// CBOR byte strings for buffer payloads.
///
/// Plain `Vec<u8>` would serialize as an integer array; NOODLES buffers are
/// byte strings on the wire.
mod cbor_bytes {
    use serde::de::{Error, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_bytes(b),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        struct BytesVisitor;

        impl<'de> Visitor<'de> for BytesVisitor {
            type Value = Option<Vec<u8>>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a byte string")
            }

            fn visit_bytes<E: Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                Ok(Some(v.to_vec()))
            }

            fn visit_byte_buf<E: Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                Ok(Some(v))
            }

            fn visit_none<E: Error>(self) -> Result<Self::Value, E> {
                Ok(None)
            }

            fn visit_some<D2: Deserializer<'de>>(self, d: D2) -> Result<Self::Value, D2::Error> {
                d.deserialize_byte_buf(BytesVisitor)
            }
        }

        deserializer.deserialize_option(BytesVisitor)
    }
}

// --- String enums ---------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttributeSemantic {
    Position,
    Normal,
    Tangent,
    Texture,
    Color,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Format {
    #[serde(rename = "U8")]
    U8,
    #[serde(rename = "U16")]
    U16,
    #[serde(rename = "U32")]
    U32,
    #[serde(rename = "U8VEC4")]
    U8Vec4,
    #[serde(rename = "U16VEC2")]
    U16Vec2,
    #[serde(rename = "VEC2")]
    Vec2,
    #[serde(rename = "VEC3")]
    Vec3,
    #[serde(rename = "VEC4")]
    Vec4,
    #[serde(rename = "MAT3")]
    Mat3,
    #[serde(rename = "MAT4")]
    Mat4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IndexFormat {
    U8,
    U16,
    U32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrimitiveType {
    Points,
    Lines,
    LineLoop,
    LineStrip,
    Triangles,
    TriangleStrip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    Text,
    Real,
    Integer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferType {
    #[serde(rename = "UNK")]
    Unknown,
    #[serde(rename = "GEOMETRY")]
    Geometry,
    #[serde(rename = "IMAGE")]
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SamplerMode {
    ClampToEdge,
    MirroredRepeat,
    Repeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MagFilter {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MinFilter {
    Nearest,
    Linear,
    LinearMipmapLinear,
}

// --- Nested value types ---------------------------------------------------

/// Documented argument of a method or signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodArg {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editor_hint: Option<String>,
}

impl MethodArg {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            doc: None,
            editor_hint: None,
        }
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: Vec3,
    pub max: Vec3,
}

impl BoundingBox {
    fn is_finite(&self) -> bool {
        self.min.iter().chain(self.max.iter()).all(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRepresentation {
    pub txt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
}

/// Web page rendered as a plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebRepresentation {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
}

/// Instance matrices for a rendered mesh, stored in a buffer view of mat4.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSource {
    pub view: BufferViewId,
    pub stride: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bb: Option<BoundingBox>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderRepresentation {
    pub mesh: GeometryId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances: Option<InstanceSource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextureRef {
    pub texture: TextureId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Mat3>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub texture_coord_slot: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PbrInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_color: Option<Rgba>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_color_texture: Option<TextureRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metallic: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roughness: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metal_rough_texture: Option<TextureRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PointLight {
    pub range: f64,
}

impl Default for PointLight {
    fn default() -> Self {
        // -1 means unbounded range.
        Self { range: -1.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotLight {
    pub range: f64,
    pub inner_cone_angle_rad: f64,
    pub outer_cone_angle_rad: f64,
}

impl Default for SpotLight {
    fn default() -> Self {
        Self {
            range: -1.0,
            inner_cone_angle_rad: 0.0,
            outer_cone_angle_rad: std::f64::consts::FRAC_PI_4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectionalLight {
    pub range: f64,
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self { range: -1.0 }
    }
}

/// Vertex attribute inside a geometry patch: a view into a buffer plus the
/// layout needed to decode it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub view: BufferViewId,
    pub semantic: AttributeSemantic,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stride: Option<u64>,
    pub format: Format,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_value: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_value: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub view: BufferViewId,
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stride: Option<u64>,
    pub format: IndexFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometryPatch {
    pub attributes: Vec<Attribute>,
    pub vertex_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indices: Option<Index>,
    #[serde(rename = "type")]
    pub primitive_type: PrimitiveType,
    pub material: MaterialId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub key_from_inclusive: i64,
    pub key_to_exclusive: i64,
}

/// Named selection of table rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_ranges: Option<Vec<SelectionRange>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub col_type: ColumnType,
}

/// Full table contents, as served to a subscribing client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInitData {
    pub columns: Vec<TableColumnInfo>,
    pub keys: Vec<i64>,
    pub data: Vec<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selections: Option<Vec<Selection>>,
}

// --- Component records ----------------------------------------------------

/// An RPC entry exposed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Method {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_doc: Option<String>,
    #[serde(default)]
    pub arg_doc: Vec<MethodArg>,
}

impl Method {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A server-originated event clients can observe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Signal {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
    #[serde(default)]
    pub arg_doc: Vec<MethodArg>,
}

impl Signal {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Scene node: possibly renderable, possibly parented, carries attached
/// methods, signals, lights, tables, and plots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Entity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Mat4>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_rep: Option<TextRepresentation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_rep: Option<WebRepresentation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_rep: Option<RenderRepresentation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lights: Option<Vec<LightId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tables: Option<Vec<TableId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plots: Option<Vec<PlotId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods_list: Option<Vec<MethodId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signals_list: Option<Vec<SignalId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub influence: Option<BoundingBox>,
}

/// Abstract plot over a table; exactly one of `simple_plot` / `url_plot`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Plot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<TableId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simple_plot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_plot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods_list: Option<Vec<MethodId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signals_list: Option<Vec<SignalId>>,
}

/// Raw bytes backing views, inline or by URI; exactly one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Buffer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub size: u64,
    #[serde(default, with = "cbor_bytes", skip_serializing_if = "Option::is_none")]
    pub inline_bytes: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri_bytes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferView {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub source_buffer: BufferId,
    #[serde(rename = "type")]
    pub view_type: BufferType,
    pub offset: u64,
    pub length: u64,
}

/// PBR material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Material {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pbr_info: Option<PbrInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normal_texture: Option<TextureRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occlusion_texture: Option<TextureRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occlusion_texture_factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emissive_texture: Option<TextureRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emissive_factor: Option<Vec3>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_alpha: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alpha_cutoff: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub double_sided: Option<bool>,
}

/// Image data, from a buffer view or an external URI; exactly one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Image {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_source: Option<BufferViewId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri_source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Texture {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub image: ImageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampler: Option<SamplerId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Sampler {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mag_filter: Option<MagFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_filter: Option<MinFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrap_s: Option<SamplerMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrap_t: Option<SamplerMode>,
}

/// Light source; exactly one of `point` / `spot` / `directional`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Light {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<Rgb>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intensity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point: Option<PointLight>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot: Option<SpotLight>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directional: Option<DirectionalLight>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Geometry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub patches: Vec<GeometryPatch>,
}

/// Tabular data; row storage lives on the table's delegate, the component
/// record carries only metadata and attachments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Table {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods_list: Option<Vec<MethodId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signals_list: Option<Vec<SignalId>>,
}

/// Tagged sum over the component kinds; the registry stores these.
#[derive(Debug, Clone, PartialEq)]
pub enum Component {
    Method(Method),
    Signal(Signal),
    Entity(Entity),
    Plot(Plot),
    Buffer(Buffer),
    BufferView(BufferView),
    Material(Material),
    Image(Image),
    Texture(Texture),
    Sampler(Sampler),
    Light(Light),
    Geometry(Geometry),
    Table(Table),
}

impl Component {
    pub fn kind(&self) -> ComponentKind {
        match self {
            Component::Method(_) => ComponentKind::Method,
            Component::Signal(_) => ComponentKind::Signal,
            Component::Entity(_) => ComponentKind::Entity,
            Component::Plot(_) => ComponentKind::Plot,
            Component::Buffer(_) => ComponentKind::Buffer,
            Component::BufferView(_) => ComponentKind::BufferView,
            Component::Material(_) => ComponentKind::Material,
            Component::Image(_) => ComponentKind::Image,
            Component::Texture(_) => ComponentKind::Texture,
            Component::Sampler(_) => ComponentKind::Sampler,
            Component::Light(_) => ComponentKind::Light,
            Component::Geometry(_) => ComponentKind::Geometry,
            Component::Table(_) => ComponentKind::Table,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Component::Method(m) => Some(&m.name),
            Component::Signal(s) => Some(&s.name),
            Component::Entity(e) => e.name.as_deref(),
            Component::Plot(p) => p.name.as_deref(),
            Component::Buffer(b) => b.name.as_deref(),
            Component::BufferView(v) => v.name.as_deref(),
            Component::Material(m) => m.name.as_deref(),
            Component::Image(i) => i.name.as_deref(),
            Component::Texture(t) => t.name.as_deref(),
            Component::Sampler(s) => s.name.as_deref(),
            Component::Light(l) => l.name.as_deref(),
            Component::Geometry(g) => g.name.as_deref(),
            Component::Table(t) => t.name.as_deref(),
        }
    }

    /// Every component ID this record references.
    pub fn collect_refs(&self, out: &mut Vec<ComponentId>) {
        match self {
            Component::Method(_) | Component::Signal(_) | Component::Buffer(_) | Component::Sampler(_) | Component::Light(_) => {}
            Component::Entity(e) => collect_entity_refs(e, out),
            Component::Plot(p) => {
                push_opt(out, p.table);
                push_ids(out, &p.methods_list);
                push_ids(out, &p.signals_list);
            }
            Component::BufferView(v) => out.push(v.source_buffer.into()),
            Component::Material(m) => collect_material_refs(m, out),
            Component::Image(i) => push_opt(out, i.buffer_source),
            Component::Texture(t) => {
                out.push(t.image.into());
                push_opt(out, t.sampler);
            }
            Component::Geometry(g) => {
                for patch in &g.patches {
                    out.push(patch.material.into());
                    for attr in &patch.attributes {
                        out.push(attr.view.into());
                    }
                    if let Some(index) = &patch.indices {
                        out.push(index.view.into());
                    }
                }
            }
            Component::Table(t) => {
                push_ids(out, &t.methods_list);
                push_ids(out, &t.signals_list);
            }
        }
    }

    pub fn refs(&self) -> Vec<ComponentId> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    /// One-of constraints and finiteness checks; reference liveness is the
    /// registry's job.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Component::Plot(p) => {
                one_of(
                    ComponentKind::Plot,
                    "simple_plot/url_plot",
                    &[p.simple_plot.is_some(), p.url_plot.is_some()],
                )
            }
            Component::Buffer(b) => one_of(
                ComponentKind::Buffer,
                "inline_bytes/uri_bytes",
                &[b.inline_bytes.is_some(), b.uri_bytes.is_some()],
            ),
            Component::Image(i) => one_of(
                ComponentKind::Image,
                "buffer_source/uri_source",
                &[i.buffer_source.is_some(), i.uri_source.is_some()],
            ),
            Component::Light(l) => {
                one_of(
                    ComponentKind::Light,
                    "point/spot/directional",
                    &[l.point.is_some(), l.spot.is_some(), l.directional.is_some()],
                )?;
                ensure_finite(
                    ComponentKind::Light,
                    "intensity",
                    l.intensity.iter().copied(),
                )?;
                ensure_finite(
                    ComponentKind::Light,
                    "color",
                    l.color.iter().flatten().copied(),
                )
            }
            Component::Entity(e) => {
                if let Some(t) = &e.transform {
                    ensure_finite(ComponentKind::Entity, "transform", t.iter().copied())?;
                }
                if let Some(bb) = &e.influence {
                    if !bb.is_finite() {
                        return Err(ValidationError::NonFinite {
                            kind: ComponentKind::Entity,
                            field: "influence",
                        });
                    }
                }
                Ok(())
            }
            Component::Material(m) => {
                for (tex, field) in [
                    (&m.normal_texture, "normal_texture.transform"),
                    (&m.occlusion_texture, "occlusion_texture.transform"),
                    (&m.emissive_texture, "emissive_texture.transform"),
                ] {
                    if let Some(t) = tex.as_ref().and_then(|t| t.transform.as_ref()) {
                        ensure_finite(ComponentKind::Material, field, t.iter().copied())?;
                    }
                }
                Ok(())
            }
            Component::Geometry(g) => {
                let bounds = g.patches.iter().flat_map(|patch| {
                    patch
                        .attributes
                        .iter()
                        .flat_map(|a| a.minimum_value.iter().chain(a.maximum_value.iter()))
                        .flatten()
                        .copied()
                });
                ensure_finite(ComponentKind::Geometry, "attribute bounds", bounds)
            }
            _ => Ok(()),
        }
    }

    /// IDs of the methods attached to this component, where the kind carries
    /// an attachment list.
    pub fn methods_list(&self) -> Option<&[MethodId]> {
        match self {
            Component::Entity(e) => e.methods_list.as_deref(),
            Component::Plot(p) => p.methods_list.as_deref(),
            Component::Table(t) => t.methods_list.as_deref(),
            _ => None,
        }
    }
}

fn push_opt<I: Into<ComponentId>>(out: &mut Vec<ComponentId>, id: Option<I>) {
    if let Some(id) = id {
        out.push(id.into());
    }
}

fn push_ids<I: Into<ComponentId> + Copy>(out: &mut Vec<ComponentId>, ids: &Option<Vec<I>>) {
    if let Some(ids) = ids {
        out.extend(ids.iter().map(|&id| id.into()));
    }
}

fn collect_entity_refs(e: &Entity, out: &mut Vec<ComponentId>) {
    push_opt(out, e.parent);
    if let Some(rep) = &e.render_rep {
        out.push(rep.mesh.into());
        if let Some(instances) = &rep.instances {
            out.push(instances.view.into());
        }
    }
    push_ids(out, &e.lights);
    push_ids(out, &e.tables);
    push_ids(out, &e.plots);
    push_ids(out, &e.methods_list);
    push_ids(out, &e.signals_list);
}

fn collect_material_refs(m: &Material, out: &mut Vec<ComponentId>) {
    let texture_refs = [
        m.normal_texture.as_ref(),
        m.occlusion_texture.as_ref(),
        m.emissive_texture.as_ref(),
        m.pbr_info.as_ref().and_then(|p| p.base_color_texture.as_ref()),
        m.pbr_info.as_ref().and_then(|p| p.metal_rough_texture.as_ref()),
    ];
    for tex in texture_refs.into_iter().flatten() {
        out.push(tex.texture.into());
    }
}

fn one_of(
    kind: ComponentKind,
    fields: &'static str,
    present: &[bool],
) -> Result<(), ValidationError> {
    if present.iter().filter(|&&p| p).count() == 1 {
        Ok(())
    } else {
        Err(ValidationError::OneOf { kind, fields })
    }
}

fn ensure_finite(
    kind: ComponentKind,
    field: &'static str,
    values: impl Iterator<Item = f64>,
) -> Result<(), ValidationError> {
    for v in values {
        if !v.is_finite() {
            return Err(ValidationError::NonFinite { kind, field });
        }
    }
    Ok(())
}

// --- Update patches -------------------------------------------------------

macro_rules! patch_struct {
    ($(#[$meta:meta])* $name:ident { $($field:ident : $ty:ty),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
        pub struct $name {
            $(
                #[serde(default, skip_serializing_if = "Option::is_none")]
                pub $field: Option<$ty>,
            )*
        }

        impl $name {
            pub fn is_empty(&self) -> bool {
                true $(&& self.$field.is_none())*
            }
        }
    };
}

patch_struct!(
    /// Field overwrite set for an entity; `None` leaves the field unchanged.
    EntityUpdate {
        name: String,
        parent: EntityId,
        transform: Mat4,
        text_rep: TextRepresentation,
        web_rep: WebRepresentation,
        render_rep: RenderRepresentation,
        lights: Vec<LightId>,
        tables: Vec<TableId>,
        plots: Vec<PlotId>,
        tags: Vec<String>,
        methods_list: Vec<MethodId>,
        signals_list: Vec<SignalId>,
        influence: BoundingBox,
    }
);

patch_struct!(
    PlotUpdate {
        name: String,
        table: TableId,
        simple_plot: String,
        url_plot: String,
        methods_list: Vec<MethodId>,
        signals_list: Vec<SignalId>,
    }
);

patch_struct!(
    MaterialUpdate {
        name: String,
        pbr_info: PbrInfo,
        normal_texture: TextureRef,
        occlusion_texture: TextureRef,
        occlusion_texture_factor: f64,
        emissive_texture: TextureRef,
        emissive_factor: Vec3,
        use_alpha: bool,
        alpha_cutoff: f64,
        double_sided: bool,
    }
);

patch_struct!(
    LightUpdate {
        name: String,
        color: Rgb,
        intensity: f64,
        point: PointLight,
        spot: SpotLight,
        directional: DirectionalLight,
    }
);

patch_struct!(
    TableUpdatePatch {
        name: String,
        meta: String,
        methods_list: Vec<MethodId>,
        signals_list: Vec<SignalId>,
    }
);

/// A field-overwrite delta for one of the updatable component kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentUpdate {
    Entity(EntityUpdate),
    Plot(PlotUpdate),
    Material(MaterialUpdate),
    Light(LightUpdate),
    Table(TableUpdatePatch),
}

macro_rules! apply_fields {
    ($target:expr, $patch:expr, [$($field:ident),* $(,)?]) => {
        $(
            if let Some(v) = $patch.$field.clone() {
                $target.$field = Some(v);
            }
        )*
    };
}

impl ComponentUpdate {
    pub fn kind(&self) -> ComponentKind {
        match self {
            ComponentUpdate::Entity(_) => ComponentKind::Entity,
            ComponentUpdate::Plot(_) => ComponentKind::Plot,
            ComponentUpdate::Material(_) => ComponentKind::Material,
            ComponentUpdate::Light(_) => ComponentKind::Light,
            ComponentUpdate::Table(_) => ComponentKind::Table,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ComponentUpdate::Entity(p) => p.is_empty(),
            ComponentUpdate::Plot(p) => p.is_empty(),
            ComponentUpdate::Material(p) => p.is_empty(),
            ComponentUpdate::Light(p) => p.is_empty(),
            ComponentUpdate::Table(p) => p.is_empty(),
        }
    }

    /// Serialize just the overwritten fields.
    pub fn to_payload(&self) -> Result<Value, serde_cbor::Error> {
        match self {
            ComponentUpdate::Entity(p) => serde_cbor::value::to_value(p),
            ComponentUpdate::Plot(p) => serde_cbor::value::to_value(p),
            ComponentUpdate::Material(p) => serde_cbor::value::to_value(p),
            ComponentUpdate::Light(p) => serde_cbor::value::to_value(p),
            ComponentUpdate::Table(p) => serde_cbor::value::to_value(p),
        }
    }

    /// Overwrite the patched fields on `component`. The caller has already
    /// checked the kinds match.
    pub fn apply(&self, component: &mut Component) {
        match (self, component) {
            (ComponentUpdate::Entity(p), Component::Entity(e)) => {
                apply_fields!(e, p, [
                    name, parent, transform, text_rep, web_rep, render_rep,
                    lights, tables, plots, tags, methods_list, signals_list,
                    influence,
                ]);
            }
            (ComponentUpdate::Plot(p), Component::Plot(plot)) => {
                apply_fields!(plot, p, [
                    name, table, simple_plot, url_plot, methods_list, signals_list,
                ]);
            }
            (ComponentUpdate::Material(p), Component::Material(m)) => {
                apply_fields!(m, p, [
                    name, pbr_info, normal_texture, occlusion_texture,
                    occlusion_texture_factor, emissive_texture, emissive_factor,
                    use_alpha, alpha_cutoff, double_sided,
                ]);
            }
            (ComponentUpdate::Light(p), Component::Light(l)) => {
                apply_fields!(l, p, [name, color, intensity, point, spot, directional]);
            }
            (ComponentUpdate::Table(p), Component::Table(t)) => {
                apply_fields!(t, p, [name, meta, methods_list, signals_list]);
            }
            _ => {}
        }
    }
}
