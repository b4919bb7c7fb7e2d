//! Barnes-Hut octree over node positions
//!
//! Built from scratch every simulation iteration and dropped afterwards. Cells
//! live in an arena (`Vec`) and refer to their children by index; a parent is
//! always stored before its children, which lets mass aggregation run as a
//! single reverse sweep.

use glam::Vec3;

/// Bodies per leaf before it is split
const LEAF_CAPACITY: usize = 1;

/// Coincident bodies stop splitting here and share a leaf
const MAX_DEPTH: u32 = 24;

/// Relative padding added around the bounding cube
const PADDING_FACTOR: f32 = 0.05;

/// Golden angle in radians, used to spread coincident pairs apart
const GOLDEN_ANGLE: f32 = 2.399_963;

/// Axis-aligned bounding cube
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub center: Vec3,
    pub half_width: f32,
}

impl Bounds {
    pub fn new(center: Vec3, half_width: f32) -> Self {
        Self { center, half_width }
    }

    /// Smallest padded cube containing every point (unit cube around the origin if empty)
    pub fn containing(points: impl IntoIterator<Item = Vec3>) -> Self {
        let mut min = Vec3::splat(f32::MAX);
        let mut max = Vec3::splat(f32::MIN);
        let mut any = false;
        for p in points {
            min = min.min(p);
            max = max.max(p);
            any = true;
        }
        if !any {
            return Self::new(Vec3::ZERO, 1.0);
        }
        let center = (min + max) * 0.5;
        let half_width = (max - min).max_element() * 0.5;
        Self::new(center, half_width * (1.0 + PADDING_FACTOR) + 1.0)
    }

    pub fn width(&self) -> f32 {
        self.half_width * 2.0
    }

    pub fn contains(&self, point: Vec3) -> bool {
        let d = (point - self.center).abs();
        d.x <= self.half_width && d.y <= self.half_width && d.z <= self.half_width
    }

    /// Child octant index (bit 0 = +x, bit 1 = +y, bit 2 = +z)
    pub fn octant(&self, point: Vec3) -> usize {
        let mut octant = 0;
        if point.x >= self.center.x {
            octant |= 1;
        }
        if point.y >= self.center.y {
            octant |= 2;
        }
        if point.z >= self.center.z {
            octant |= 4;
        }
        octant
    }

    pub fn child(&self, octant: usize) -> Self {
        let quarter = self.half_width * 0.5;
        let offset = Vec3::new(
            if octant & 1 != 0 { quarter } else { -quarter },
            if octant & 2 != 0 { quarter } else { -quarter },
            if octant & 4 != 0 { quarter } else { -quarter },
        );
        Self::new(self.center + offset, quarter)
    }
}

#[derive(Debug, Clone, Copy)]
struct Body {
    position: Vec3,
    mass: f32,
}

/// Force on one body and the number of point-mass evaluations it took
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Repulsion {
    pub force: Vec3,
    /// Bodies and aggregated cells the force was summed over
    pub interactions: usize,
}

/// One octree cell
#[derive(Debug, Clone)]
pub struct SpatialCell {
    bounds: Bounds,
    mass: f32,
    center_of_mass: Vec3,
    children: Option<[usize; 8]>,
    bodies: Vec<usize>,
}

impl SpatialCell {
    fn empty(bounds: Bounds) -> Self {
        Self {
            bounds,
            mass: 0.0,
            center_of_mass: bounds.center,
            children: None,
            bodies: Vec::new(),
        }
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn mass(&self) -> f32 {
        self.mass
    }

    pub fn center_of_mass(&self) -> Vec3 {
        self.center_of_mass
    }

    pub fn children(&self) -> Option<&[usize; 8]> {
        self.children.as_ref()
    }

    /// Body indices stored in this cell (always empty for inner cells)
    pub fn bodies(&self) -> &[usize] {
        &self.bodies
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }
}

/// Octree answering approximate repulsion queries
pub struct Octree {
    cells: Vec<SpatialCell>,
    bodies: Vec<Body>,
}

impl Octree {
    /// Build a tree over `(position, mass)` pairs; body `i` is the i-th pair
    pub fn build(bodies: impl IntoIterator<Item = (Vec3, f32)>) -> Self {
        let bodies: Vec<Body> = bodies
            .into_iter()
            .map(|(position, mass)| Body { position, mass })
            .collect();
        let bounds = Bounds::containing(bodies.iter().map(|b| b.position));

        let mut tree = Self {
            cells: vec![SpatialCell::empty(bounds)],
            bodies,
        };
        for body in 0..tree.bodies.len() {
            tree.insert(body);
        }
        tree.aggregate();
        tree
    }

    fn insert(&mut self, body: usize) {
        let position = self.bodies[body].position;
        let mut cell = 0;
        let mut depth = 0;

        loop {
            if let Some(children) = self.cells[cell].children {
                cell = children[self.cells[cell].bounds.octant(position)];
                depth += 1;
                continue;
            }
            if self.cells[cell].bodies.len() < LEAF_CAPACITY || depth >= MAX_DEPTH {
                self.cells[cell].bodies.push(body);
                return;
            }
            self.subdivide(cell);
        }
    }

    fn subdivide(&mut self, cell: usize) {
        let bounds = self.cells[cell].bounds;
        let first = self.cells.len();
        let children: [usize; 8] = std::array::from_fn(|octant| first + octant);
        for octant in 0..8 {
            self.cells.push(SpatialCell::empty(bounds.child(octant)));
        }

        let bodies = std::mem::take(&mut self.cells[cell].bodies);
        for body in bodies {
            let octant = bounds.octant(self.bodies[body].position);
            self.cells[children[octant]].bodies.push(body);
        }
        self.cells[cell].children = Some(children);
    }

    fn aggregate(&mut self) {
        for idx in (0..self.cells.len()).rev() {
            let (mass, weighted) = match self.cells[idx].children {
                Some(children) => children.iter().fold((0.0, Vec3::ZERO), |(m, w), &c| {
                    let child = &self.cells[c];
                    (m + child.mass, w + child.center_of_mass * child.mass)
                }),
                None => self.cells[idx]
                    .bodies
                    .iter()
                    .fold((0.0, Vec3::ZERO), |(m, w), &b| {
                        let body = &self.bodies[b];
                        (m + body.mass, w + body.position * body.mass)
                    }),
            };
            let cell = &mut self.cells[idx];
            cell.mass = mass;
            cell.center_of_mass = if mass > 0.0 {
                weighted / mass
            } else {
                cell.bounds.center
            };
        }
    }

    pub fn root(&self) -> &SpatialCell {
        &self.cells[0]
    }

    pub fn cells(&self) -> &[SpatialCell] {
        &self.cells
    }

    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    pub fn depth(&self) -> usize {
        self.depth_from(0)
    }

    fn depth_from(&self, idx: usize) -> usize {
        match self.cells[idx].children {
            Some(children) => 1 + children.iter().map(|&c| self.depth_from(c)).max().unwrap_or(0),
            None => 1,
        }
    }

    /// Repulsive force on `body` from every other body
    ///
    /// A cell that does not contain the body is treated as a single point mass
    /// when `cell_width / distance < theta`; `theta = 0` evaluates every pair.
    /// Separations below `min_distance` are clamped to it.
    pub fn repulsion(&self, body: usize, theta: f32, strength: f32, min_distance: f32) -> Vec3 {
        self.evaluate(body, theta, strength, min_distance).force
    }

    /// Like [`repulsion`](Self::repulsion), also counting the interactions summed
    pub fn evaluate(&self, body: usize, theta: f32, strength: f32, min_distance: f32) -> Repulsion {
        let position = self.bodies[body].position;
        let mut force = Vec3::ZERO;
        let mut interactions = 0;
        let mut stack = vec![0usize];

        while let Some(idx) = stack.pop() {
            let cell = &self.cells[idx];
            if cell.mass <= 0.0 {
                continue;
            }
            match cell.children {
                None => {
                    for &other in &cell.bodies {
                        if other == body {
                            continue;
                        }
                        let source = &self.bodies[other];
                        interactions += 1;
                        force += pair_force(
                            position - source.position,
                            source.mass,
                            strength,
                            min_distance,
                            (body, other),
                        );
                    }
                }
                Some(children) => {
                    let delta = position - cell.center_of_mass;
                    let distance = delta.length();
                    if !cell.bounds.contains(position)
                        && distance > 0.0
                        && cell.bounds.width() / distance < theta
                    {
                        interactions += 1;
                        force += pair_force(delta, cell.mass, strength, min_distance, (body, idx));
                    } else {
                        stack.extend_from_slice(&children);
                    }
                }
            }
        }

        Repulsion {
            force,
            interactions,
        }
    }
}

/// Coulomb-style push of magnitude `strength * mass / distance^2` along `delta`
fn pair_force(
    delta: Vec3,
    mass: f32,
    strength: f32,
    min_distance: f32,
    pair: (usize, usize),
) -> Vec3 {
    let distance = delta.length();
    let direction = if distance > f32::EPSILON {
        delta / distance
    } else {
        separation_direction(pair.0, pair.1)
    };
    let distance = distance.max(min_distance);
    direction * (strength * mass / (distance * distance))
}

/// Deterministic unit vector in the xy-plane, antisymmetric in its arguments
pub fn separation_direction(a: usize, b: usize) -> Vec3 {
    let (lo, hi, sign) = if a < b { (a, b, 1.0) } else { (b, a, -1.0) };
    let angle = (lo.wrapping_mul(31).wrapping_add(hi) % 4096) as f32 * GOLDEN_ANGLE;
    Vec3::new(angle.cos(), angle.sin(), 0.0) * sign
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(n: usize) -> Vec<(Vec3, f32)> {
        (0..n)
            .map(|i| {
                let x = (i % 7) as f32 * 13.0;
                let y = ((i / 7) % 5) as f32 * 11.0;
                let z = (i / 35) as f32 * 17.0;
                (Vec3::new(x, y, z), 1.0 + (i % 3) as f32)
            })
            .collect()
    }

    /// `side^3` bodies on a slightly jittered lattice with spacing 10
    fn lattice(side: usize) -> Vec<(Vec3, f32)> {
        (0..side * side * side)
            .map(|i| {
                let x = (i % side) as f32 * 10.0 + (i * 7 % 5) as f32 * 0.3;
                let y = ((i / side) % side) as f32 * 10.0 + (i * 3 % 7) as f32 * 0.2;
                let z = (i / (side * side)) as f32 * 10.0 + (i * 11 % 3) as f32 * 0.25;
                (Vec3::new(x, y, z), 1.0)
            })
            .collect()
    }

    fn mean_interactions(tree: &Octree, theta: f32) -> f32 {
        let total: usize = (0..tree.body_count())
            .map(|body| tree.evaluate(body, theta, 30.0, 1.0).interactions)
            .sum();
        total as f32 / tree.body_count() as f32
    }

    fn brute_force(bodies: &[(Vec3, f32)], body: usize, strength: f32, min: f32) -> Vec3 {
        bodies
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != body)
            .map(|(i, &(p, m))| pair_force(bodies[body].0 - p, m, strength, min, (body, i)))
            .sum()
    }

    #[test]
    fn bounds_contain_all_points() {
        let points = [Vec3::new(-5.0, 2.0, 0.0), Vec3::new(10.0, -3.0, 4.0)];
        let bounds = Bounds::containing(points);
        assert!(points.iter().all(|&p| bounds.contains(p)));
    }

    #[test]
    fn child_bounds_partition_parent() {
        let bounds = Bounds::new(Vec3::ZERO, 8.0);
        let p = Vec3::new(3.0, -2.0, 5.0);
        let child = bounds.child(bounds.octant(p));
        assert!(child.contains(p));
        assert_eq!(child.half_width, 4.0);
    }

    #[test]
    fn aggregate_mass_matches_contents() {
        let bodies = grid(60);
        let tree = Octree::build(bodies.iter().copied());

        let total: f32 = bodies.iter().map(|b| b.1).sum();
        let weighted: Vec3 = bodies.iter().map(|b| b.0 * b.1).sum();
        assert!((tree.root().mass() - total).abs() < 1e-3);
        assert!((tree.root().center_of_mass() - weighted / total).length() < 1e-3);

        for cell in tree.cells().iter().filter(|c| !c.is_leaf()) {
            let children = cell.children().unwrap();
            let sum: f32 = children.iter().map(|&c| tree.cells()[c].mass()).sum();
            assert!((cell.mass() - sum).abs() < 1e-3);
        }
    }

    #[test]
    fn every_body_lands_in_exactly_one_leaf() {
        let tree = Octree::build(grid(50));
        let mut seen = vec![0; tree.body_count()];
        for cell in tree.cells() {
            for &b in cell.bodies() {
                seen[b] += 1;
                assert!(cell.is_leaf());
            }
        }
        assert!(seen.iter().all(|&count| count == 1));
        assert!(tree.depth() > 1);
    }

    #[test]
    fn zero_theta_is_exact() {
        let bodies = grid(40);
        let tree = Octree::build(bodies.iter().copied());
        for body in [0, 7, 23, 39] {
            let approx = tree.repulsion(body, 0.0, 30.0, 1.0);
            let exact = brute_force(&bodies, body, 30.0, 1.0);
            assert!(
                (approx - exact).length() <= 1e-4 * exact.length().max(1.0),
                "body {body}: {approx:?} vs {exact:?}"
            );
        }
    }

    #[test]
    fn zero_theta_visits_every_other_body() {
        let tree = Octree::build(lattice(8));
        for body in [0, 100, 511] {
            assert_eq!(tree.evaluate(body, 0.0, 30.0, 1.0).interactions, 511);
        }
    }

    #[test]
    fn larger_theta_prunes_far_cells() {
        let tree = Octree::build(lattice(8));
        let exact = mean_interactions(&tree, 0.0);
        let medium = mean_interactions(&tree, 0.5);
        let coarse = mean_interactions(&tree, 0.9);

        assert_eq!(exact, 511.0);
        assert!(medium < exact, "theta 0.5: {medium}");
        assert!(coarse < medium, "theta 0.9: {coarse} vs {medium}");
        assert!(coarse * 4.0 < exact, "theta 0.9 should skip most pairs: {coarse}");
    }

    #[test]
    fn interactions_grow_sublinearly_with_body_count() {
        let small = mean_interactions(&Octree::build(lattice(8)), 0.9);
        let large = mean_interactions(&Octree::build(lattice(16)), 0.9);

        // eight times the bodies; an exact sum would cost eight times as much per body
        assert!(large > small);
        assert!(large < 3.0 * small, "{small} -> {large} interactions per body");
    }

    #[test]
    fn approximation_stays_close_for_distant_clusters() {
        let mut bodies: Vec<(Vec3, f32)> = grid(30);
        bodies.push((Vec3::new(2000.0, 0.0, 0.0), 1.0));
        let far = bodies.len() - 1;
        let tree = Octree::build(bodies.iter().copied());

        let approx = tree.repulsion(far, 0.9, 30.0, 1.0);
        let exact = brute_force(&bodies, far, 30.0, 1.0);
        assert!((approx - exact).length() < 0.05 * exact.length());
        assert!(approx.x > 0.0, "far body is pushed away from the cluster");
    }

    #[test]
    fn coincident_bodies_are_pushed_apart() {
        let bodies = vec![(Vec3::ONE, 1.0), (Vec3::ONE, 1.0)];
        let tree = Octree::build(bodies);
        let a = tree.repulsion(0, 0.5, 10.0, 1.0);
        let b = tree.repulsion(1, 0.5, 10.0, 1.0);

        assert!(a.length() > 0.0 && a.is_finite());
        assert!((a + b).length() < 1e-5, "forces are equal and opposite");
    }

    #[test]
    fn single_body_feels_nothing() {
        let tree = Octree::build([(Vec3::new(4.0, 4.0, 4.0), 2.0)]);
        assert_eq!(tree.repulsion(0, 0.5, 30.0, 1.0), Vec3::ZERO);
        assert_eq!(tree.cells().len(), 1);
    }
}
