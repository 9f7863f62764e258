use ndarray::Array2;

/// Label the 8-connected components of `mask`.
///
/// Components smaller than `min_pixels` are dropped. Surviving components
/// get consecutive labels `1..=n` in raster order of their first pixel.
/// Returns the label image and `n`.
pub fn label_components(mask: &Array2<bool>, min_pixels: usize) -> (Array2<u32>, u32) {
    let (h, w) = mask.dim();
    let mut labels = Array2::<u32>::zeros((h, w));
    if h == 0 || w == 0 {
        return (labels, 0);
    }

    let mut next_label: u32 = 1;
    // Union-find parent array. Index 0 unused; labels start at 1.
    let mut parent: Vec<u32> = vec![0; 2];

    // Pass 1: provisional labels from the already visited neighbours.
    for row in 0..h {
        for col in 0..w {
            if !mask[[row, col]] {
                continue;
            }
            let mut neighbours = [0u32; 4];
            if col > 0 {
                neighbours[0] = labels[[row, col - 1]];
            }
            if row > 0 {
                neighbours[1] = labels[[row - 1, col]];
                if col > 0 {
                    neighbours[2] = labels[[row - 1, col - 1]];
                }
                if col + 1 < w {
                    neighbours[3] = labels[[row - 1, col + 1]];
                }
            }

            let smallest = neighbours.iter().copied().filter(|&l| l > 0).min();
            match smallest {
                None => {
                    if next_label as usize >= parent.len() {
                        parent.resize(parent.len() * 2, 0);
                    }
                    parent[next_label as usize] = next_label;
                    labels[[row, col]] = next_label;
                    next_label += 1;
                }
                Some(s) => {
                    labels[[row, col]] = s;
                    for &n in neighbours.iter().filter(|&&l| l > 0 && l != s) {
                        union(&mut parent, s, n);
                    }
                }
            }
        }
    }

    for i in 1..next_label as usize {
        parent[i] = find(&parent, i as u32);
    }

    // Pass 2: resolve roots and measure areas.
    let mut area = vec![0usize; next_label as usize];
    for l in labels.iter_mut().filter(|l| **l > 0) {
        *l = parent[*l as usize];
        area[*l as usize] += 1;
    }

    // Consecutive renumbering in raster order, dropping small components.
    let mut renumber = vec![0u32; next_label as usize];
    let mut n = 0u32;
    for l in labels.iter_mut().filter(|l| **l > 0) {
        let root = *l as usize;
        if area[root] < min_pixels {
            *l = 0;
            continue;
        }
        if renumber[root] == 0 {
            n += 1;
            renumber[root] = n;
        }
        *l = renumber[root];
    }
    (labels, n)
}

fn find(parent: &[u32], mut x: u32) -> u32 {
    while parent[x as usize] != x {
        x = parent[x as usize];
    }
    x
}

fn union(parent: &mut [u32], a: u32, b: u32) {
    let ra = find(parent, a);
    let rb = find(parent, b);
    if ra != rb {
        let (small, big) = if ra < rb { (ra, rb) } else { (rb, ra) };
        parent[big as usize] = small;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagonal_pixels_connect() {
        let mut mask = Array2::from_elem((4, 4), false);
        mask[[0, 0]] = true;
        mask[[1, 1]] = true;
        mask[[3, 3]] = true;
        let (labels, n) = label_components(&mask, 1);
        assert_eq!(n, 2);
        assert_eq!(labels[[0, 0]], labels[[1, 1]]);
        assert_eq!(labels[[3, 3]], 2);
    }

    #[test]
    fn test_u_shape_merges() {
        let mut mask = Array2::from_elem((3, 5), false);
        for r in 0..3 {
            mask[[r, 0]] = true;
            mask[[r, 4]] = true;
        }
        for c in 0..5 {
            mask[[2, c]] = true;
        }
        let (labels, n) = label_components(&mask, 1);
        assert_eq!(n, 1);
        assert!(labels.iter().all(|&l| l <= 1));
    }

    #[test]
    fn test_small_components_dropped() {
        let mut mask = Array2::from_elem((5, 5), false);
        mask[[0, 0]] = true;
        for r in 2..5 {
            for c in 2..5 {
                mask[[r, c]] = true;
            }
        }
        let (labels, n) = label_components(&mask, 5);
        assert_eq!(n, 1);
        assert_eq!(labels[[0, 0]], 0);
        assert_eq!(labels[[3, 3]], 1);
    }
}
