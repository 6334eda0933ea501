//! Types, aliases and helper operations for doing math with `ultraviolet`.
use std::f64::consts::PI;
pub use ultraviolet as uv;

/// A Pose has a rotation and a translation, no scaling.
///
/// Every shape in a collision query is placed in the world with a Pose.
pub type Pose = uv::DIsometry3;
pub type Vec3 = uv::DVec3;
pub type Mat3 = uv::DMat3;
pub type Rotor3 = uv::DRotor3;

/// An angle in either degrees or radians.
/// Default conversion from f64 is in degrees.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(serde::Deserialize, serde::Serialize))]
pub enum Angle {
    Rad(f64),
    Deg(f64),
}
impl Angle {
    /// Get the angle as degrees.
    #[inline]
    pub fn deg(&self) -> f64 {
        match self {
            Angle::Rad(rad) => rad * 180.0 / PI,
            Angle::Deg(deg) => *deg,
        }
    }

    /// Get the angle as radians.
    #[inline]
    pub fn rad(&self) -> f64 {
        match self {
            Angle::Rad(rad) => *rad,
            Angle::Deg(deg) => deg * PI / 180.0,
        }
    }
}
impl Default for Angle {
    fn default() -> Self {
        Angle::Rad(0.0)
    }
}
impl From<f64> for Angle {
    fn from(deg: f64) -> Self {
        Angle::Deg(deg)
    }
}

/// A builder to create [`Pose`][self::Pose]s.
///
/// Rotation is given as Euler angles in the order roll (around z),
/// pitch (around x), yaw (around y), matching `ultraviolet`.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde-types", serde(default))]
pub struct PoseBuilder {
    position: [f64; 3],
    roll: Angle,
    pitch: Angle,
    yaw: Angle,
}
impl PoseBuilder {
    pub fn new() -> Self {
        PoseBuilder {
            position: [0.0; 3],
            roll: Angle::default(),
            pitch: Angle::default(),
            yaw: Angle::default(),
        }
    }
    #[inline]
    pub fn with_position(mut self, pos: impl Into<[f64; 3]>) -> Self {
        self.position = pos.into();
        self
    }
    #[inline]
    pub fn with_rotation(mut self, roll: Angle, pitch: Angle, yaw: Angle) -> Self {
        self.roll = roll;
        self.pitch = pitch;
        self.yaw = yaw;
        self
    }
    #[inline]
    pub fn build(self) -> Pose {
        Pose::new(
            Vec3::from(self.position),
            Rotor3::from_euler_angles(self.roll.rad(), self.pitch.rad(), self.yaw.rad()),
        )
    }
}
impl Default for PoseBuilder {
    fn default() -> Self {
        Self::new()
    }
}
impl From<PoseBuilder> for Pose {
    fn from(builder: PoseBuilder) -> Pose {
        builder.build()
    }
}
impl From<[f64; 3]> for PoseBuilder {
    fn from(vec: [f64; 3]) -> Self {
        PoseBuilder::new().with_position(vec)
    }
}
impl From<Vec3> for PoseBuilder {
    fn from(vec: Vec3) -> Self {
        PoseBuilder::new().with_position(vec)
    }
}

/// Rotation of a pose as a matrix, for applying it to many vectors.
#[inline]
pub fn rotation_matrix(pose: &Pose) -> Mat3 {
    pose.rotation.into_matrix()
}
