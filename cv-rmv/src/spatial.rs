//! Uniform grids over an image area for fast neighborhood queries on 2D point clouds.

use cv_core::nalgebra::Point2;

/// Point indices distributed into a uniform grid of bins.
///
/// The grid covers `[left, left + width) x [top, top + height)`. Points outside of the area are stored in
/// the nearest border bin, so every point of the distributed cloud is reachable.
#[derive(Debug, Clone, PartialEq)]
pub struct DistributionArray {
    left: f64,
    top: f64,
    width: f64,
    height: f64,
    horizontal_bins: usize,
    vertical_bins: usize,
    bins: Vec<Vec<usize>>,
}

impl DistributionArray {
    /// Creates an empty grid, at least one bin is used in each direction.
    pub fn new(
        left: f64,
        top: f64,
        width: f64,
        height: f64,
        horizontal_bins: usize,
        vertical_bins: usize,
    ) -> Self {
        let horizontal_bins = horizontal_bins.max(1);
        let vertical_bins = vertical_bins.max(1);
        Self {
            left,
            top,
            width: width.max(f64::EPSILON),
            height: height.max(f64::EPSILON),
            horizontal_bins,
            vertical_bins,
            bins: vec![Vec::new(); horizontal_bins * vertical_bins],
        }
    }

    pub fn horizontal_bins(&self) -> usize {
        self.horizontal_bins
    }

    pub fn vertical_bins(&self) -> usize {
        self.vertical_bins
    }

    pub fn bin_width(&self) -> f64 {
        self.width / self.horizontal_bins as f64
    }

    pub fn bin_height(&self) -> f64 {
        self.height / self.vertical_bins as f64
    }

    fn horizontal_bin(&self, x: f64) -> usize {
        let bin = ((x - self.left) / self.bin_width()).floor();
        bin.clamp(0.0, (self.horizontal_bins - 1) as f64) as usize
    }

    fn vertical_bin(&self, y: f64) -> usize {
        let bin = ((y - self.top) / self.bin_height()).floor();
        bin.clamp(0.0, (self.vertical_bins - 1) as f64) as usize
    }

    /// The bin a point belongs to, clamped into the grid.
    pub fn bin_of(&self, point: &Point2<f64>) -> (usize, usize) {
        (self.horizontal_bin(point.x), self.vertical_bin(point.y))
    }

    /// The point indices stored in one bin.
    pub fn bin(&self, horizontal: usize, vertical: usize) -> &[usize] {
        &self.bins[vertical * self.horizontal_bins + horizontal]
    }

    pub fn insert(&mut self, point: &Point2<f64>, index: usize) {
        let (horizontal, vertical) = self.bin_of(point);
        self.bins[vertical * self.horizontal_bins + horizontal].push(index);
    }

    /// All indices stored in bins overlapping the square of `radius` around `point`.
    pub fn indices_around<'a>(
        &'a self,
        point: &Point2<f64>,
        radius: f64,
    ) -> impl Iterator<Item = usize> + 'a {
        let x_range = self.horizontal_bin(point.x - radius)..=self.horizontal_bin(point.x + radius);
        let y_range = self.vertical_bin(point.y - radius)..=self.vertical_bin(point.y + radius);
        y_range.flat_map(move |vertical| {
            x_range
                .clone()
                .flat_map(move |horizontal| self.bin(horizontal, vertical).iter().copied())
        })
    }

    /// All indices stored in the 3x3 bin neighborhood of the bin containing `point`.
    pub fn indices_in_neighborhood<'a>(
        &'a self,
        point: &Point2<f64>,
    ) -> impl Iterator<Item = usize> + 'a {
        let (horizontal, vertical) = self.bin_of(point);
        let x_range = horizontal.saturating_sub(1)..=(horizontal + 1).min(self.horizontal_bins - 1);
        let y_range = vertical.saturating_sub(1)..=(vertical + 1).min(self.vertical_bins - 1);
        y_range.flat_map(move |vertical| {
            x_range
                .clone()
                .flat_map(move |horizontal| self.bin(horizontal, vertical).iter().copied())
        })
    }
}

/// Number of bins so that every bin is about `bin_size` pixels wide and high.
pub fn ideal_bins(width: f64, height: f64, bin_size: f64) -> (usize, usize) {
    let bin_size = bin_size.max(1.0);
    (
        ((width / bin_size) as usize).max(1),
        ((height / bin_size) as usize).max(1),
    )
}

/// Distributes the indices of `points` into a grid covering the given area.
pub fn distribute_to_array(
    points: &[Point2<f64>],
    left: f64,
    top: f64,
    width: f64,
    height: f64,
    horizontal_bins: usize,
    vertical_bins: usize,
) -> DistributionArray {
    let mut array = DistributionArray::new(left, top, width, height, horizontal_bins, vertical_bins);
    for (index, point) in points.iter().enumerate() {
        array.insert(point, index);
    }
    array
}

/// Indices of all points within `radius` (inclusive) of `point`.
pub fn determine_neighbors(
    point: &Point2<f64>,
    points: &[Point2<f64>],
    radius: f64,
    distribution: &DistributionArray,
) -> Vec<usize> {
    let sqr_radius = radius * radius;
    distribution
        .indices_around(point, radius)
        .filter(|&index| (points[index] - point).norm_squared() <= sqr_radius)
        .collect()
}

/// The nearest point within `radius` of `point` and its squared distance.
pub fn determine_nearest_neighbor(
    point: &Point2<f64>,
    points: &[Point2<f64>],
    radius: f64,
    distribution: &DistributionArray,
) -> Option<(usize, f64)> {
    let sqr_radius = radius * radius;
    distribution
        .indices_around(point, radius)
        .map(|index| (index, (points[index] - point).norm_squared()))
        .filter(|&(_, sqr_distance)| sqr_distance <= sqr_radius)
        .min_by(|a, b| a.1.total_cmp(&b.1))
}

/// The smallest squared distance between `points[index]` and any other point in the 3x3 bin neighborhood.
///
/// Returns `f64::MAX` if the neighborhood holds no other point.
pub fn determine_minimal_sqr_distance(
    points: &[Point2<f64>],
    index: usize,
    distribution: &DistributionArray,
) -> f64 {
    let point = &points[index];
    distribution
        .indices_in_neighborhood(point)
        .filter(|&other| other != index)
        .map(|other| (points[other] - point).norm_squared())
        .fold(f64::MAX, f64::min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64;

    fn random_points(count: usize, seed: u64) -> Vec<Point2<f64>> {
        let mut rng = Pcg64::seed_from_u64(seed);
        (0..count)
            .map(|_| Point2::new(rng.gen_range(0.0..640.0), rng.gen_range(0.0..480.0)))
            .collect()
    }

    #[test]
    fn neighbors_match_brute_force() {
        let points = random_points(500, 0);
        let distribution = distribute_to_array(&points, 0.0, 0.0, 640.0, 480.0, 32, 24);
        for query in random_points(50, 1) {
            let mut expected: Vec<usize> = (0..points.len())
                .filter(|&index| (points[index] - query).norm() <= 30.0)
                .collect();
            let mut found = determine_neighbors(&query, &points, 30.0, &distribution);
            expected.sort_unstable();
            found.sort_unstable();
            assert_eq!(found, expected);

            let nearest = (0..points.len())
                .map(|index| (index, (points[index] - query).norm_squared()))
                .filter(|&(_, sqr_distance)| sqr_distance <= 900.0)
                .min_by(|a, b| a.1.total_cmp(&b.1));
            assert_eq!(determine_nearest_neighbor(&query, &points, 30.0, &distribution), nearest);
        }
    }

    #[test]
    fn outside_points_land_in_border_bins() {
        let points = [Point2::new(-50.0, 10.0), Point2::new(700.0, 500.0)];
        let distribution = distribute_to_array(&points, 0.0, 0.0, 640.0, 480.0, 10, 10);
        assert_eq!(distribution.bin(0, 0), &[0]);
        assert_eq!(distribution.bin(9, 9), &[1]);
    }

    #[test]
    fn minimal_sqr_distance() {
        let points = [Point2::new(10.0, 10.0), Point2::new(13.0, 14.0), Point2::new(400.0, 400.0)];
        let distribution = distribute_to_array(&points, 0.0, 0.0, 640.0, 480.0, 32, 24);
        assert_eq!(determine_minimal_sqr_distance(&points, 0, &distribution), 25.0);
        assert_eq!(determine_minimal_sqr_distance(&points, 2, &distribution), f64::MAX);
        assert_eq!(ideal_bins(640.0, 480.0, 20.0), (32, 24));
        assert_eq!(ideal_bins(5.0, 5.0, 20.0), (1, 1));
    }
}
